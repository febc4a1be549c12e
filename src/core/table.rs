//! Typed columnar table
//!
//! The standardized form of a route once enrichment has settled the column
//! set: a fixed, ordered schema of named typed columns sharing one row index.

use std::collections::HashMap;

use serde::Serialize;

use crate::core::model::{ColumnType, Route, Value, BASE_COLUMNS};
use crate::{Error, Result};

/// One column of the schema
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
    /// Momentary event column (defaults to impulse sampling)
    pub event: bool,
    /// Label column (ids and the like): numeric storage, no interpolation
    pub categorical: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
            event: false,
            categorical: false,
        }
    }

    pub fn event(mut self, event: bool) -> Self {
        self.event = event;
        self
    }

    pub fn categorical(mut self, categorical: bool) -> Self {
        self.categorical = categorical;
        self
    }

    /// Values can be blended between two points
    pub fn is_interpolable(&self) -> bool {
        self.kind.is_numeric() && !self.categorical
    }
}

/// Fixed-schema columnar table
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    schema: Vec<Column>,
    columns: Vec<Vec<Value>>,
    rows: usize,
}

fn base_column(name: &str) -> Column {
    let kind = if name == "timestamp" {
        ColumnType::Time
    } else {
        ColumnType::Number
    };
    Column::new(name, kind)
}

impl Table {
    /// Build a table from parallel columns, checking lengths and value types
    pub fn new(schema: Vec<Column>, columns: Vec<Vec<Value>>) -> Result<Self> {
        if schema.len() != columns.len() {
            return Err(Error::SchemaMismatch {
                column: String::new(),
                message: format!(
                    "{} columns declared but {} provided",
                    schema.len(),
                    columns.len()
                ),
            });
        }
        let rows = columns.first().map(Vec::len).unwrap_or(0);
        for (column, values) in schema.iter().zip(&columns) {
            if values.len() != rows {
                return Err(Error::SchemaMismatch {
                    column: column.name.clone(),
                    message: format!("expected {rows} rows, got {}", values.len()),
                });
            }
            if let Some(bad) = values
                .iter()
                .filter_map(Value::kind)
                .find(|kind| *kind != column.kind)
            {
                return Err(Error::SchemaMismatch {
                    column: column.name.clone(),
                    message: format!("declared as {} but holds a {bad} value", column.kind),
                });
            }
        }
        Ok(Self {
            schema,
            columns,
            rows,
        })
    }

    /// Standardize a route: base columns first, then declared columns, then
    /// remaining attributes in order of first appearance
    pub fn from_route(route: &Route) -> Result<Self> {
        let mut schema: Vec<Column> = BASE_COLUMNS.iter().map(|name| base_column(name)).collect();
        let mut positions: HashMap<String, usize> = schema
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        let mut inferred: Vec<bool> = vec![true; schema.len()];

        for (name, kind) in &route.declared_columns {
            if positions.contains_key(name) {
                continue;
            }
            positions.insert(name.clone(), schema.len());
            schema.push(
                Column::new(name.clone(), *kind)
                    .event(route.event_columns.contains(name))
                    .categorical(route.categorical_columns.contains(name)),
            );
            inferred.push(true);
        }

        for point in route.points() {
            for (name, value) in &point.attributes {
                match positions.get(name) {
                    Some(&i) => {
                        if !inferred[i] {
                            if let Some(kind) = value.kind() {
                                schema[i].kind = kind;
                                inferred[i] = true;
                            }
                        }
                    }
                    None => {
                        positions.insert(name.clone(), schema.len());
                        let column = Column::new(name.clone(), value.kind().unwrap_or(ColumnType::Text))
                            .event(route.event_columns.contains(name))
                            .categorical(route.categorical_columns.contains(name));
                        schema.push(column);
                        inferred.push(value.kind().is_some());
                    }
                }
            }
        }

        let columns = schema
            .iter()
            .map(|column| route.points().iter().map(|p| p.value(&column.name)).collect())
            .collect();
        Self::new(schema, columns)
    }

    pub fn schema(&self) -> &[Column] {
        &self.schema
    }

    pub fn column_names(&self) -> Vec<String> {
        self.schema.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.iter().position(|c| c.name == name)
    }

    /// Values of a column by name
    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.column_index(name).map(|i| self.columns[i].as_slice())
    }

    pub fn column_at(&self, index: usize) -> &[Value] {
        &self.columns[index]
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// One row, in schema order
    pub fn row(&self, index: usize) -> Vec<&Value> {
        self.columns.iter().map(|c| &c[index]).collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = Vec<&Value>> + '_ {
        (0..self.rows).map(move |i| self.row(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::TrackPoint;

    fn route() -> Route {
        let points = vec![
            TrackPoint::new(50.0, 4.0).with_attribute("surface", Value::Text("asphalt".into())),
            TrackPoint::new(50.001, 4.0)
                .with_attribute("lanes", Value::Number(2.0))
                .with_attribute("surface", Value::Null),
        ];
        let mut route = Route::new("r", points).unwrap();
        route.declare_column("matched", ColumnType::Flag);
        route
    }

    #[test]
    fn test_schema_order() {
        let table = Table::from_route(&route()).unwrap();
        assert_eq!(
            table.column_names(),
            vec!["latitude", "longitude", "elevation", "timestamp", "speed", "matched", "surface", "lanes"]
        );
        assert_eq!(table.len(), 2);
        assert_eq!(table.schema()[3].kind, ColumnType::Time);
        assert_eq!(table.schema()[5].kind, ColumnType::Flag);
        assert_eq!(table.schema()[7].kind, ColumnType::Number);
    }

    #[test]
    fn test_missing_values_are_null() {
        let table = Table::from_route(&route()).unwrap();
        assert_eq!(
            table.column("lanes").unwrap(),
            &[Value::Null, Value::Number(2.0)]
        );
        assert_eq!(table.column("matched").unwrap(), &[Value::Null, Value::Null]);
        assert!(table.column("nope").is_none());
        assert_eq!(table.row(0)[0], &Value::Number(50.0));
    }

    #[test]
    fn test_conflicting_types_are_rejected() {
        let points = vec![
            TrackPoint::new(50.0, 4.0).with_attribute("lanes", Value::Number(2.0)),
            TrackPoint::new(50.001, 4.0).with_attribute("lanes", Value::Text("two".into())),
        ];
        let route = Route::new("r", points).unwrap();
        let err = Table::from_route(&route).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { column, .. } if column == "lanes"));
    }

    #[test]
    fn test_categorical_columns_are_flagged() {
        let mut route = route();
        route.declare_column("way_id", ColumnType::Number);
        route.mark_categorical("way_id");
        let table = Table::from_route(&route).unwrap();
        let way_id = &table.schema()[table.column_index("way_id").unwrap()];
        assert!(way_id.categorical);
        assert!(!way_id.is_interpolable());
        let lanes = &table.schema()[table.column_index("lanes").unwrap()];
        assert!(lanes.is_interpolable());
    }

    #[test]
    fn test_new_checks_lengths() {
        let schema = vec![Column::new("a", ColumnType::Number), Column::new("b", ColumnType::Number)];
        let err = Table::new(schema, vec![vec![Value::Number(1.0)], vec![]]).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
    }
}
