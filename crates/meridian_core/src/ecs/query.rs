//! # State Queries
//!
//! Read-only search over the world state for the service layer.
//!
//! Rows come out in archetype ID order, then row order within each
//! archetype. Each row maps `_id` to the entity ID and every component
//! name to its value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::archetype::ArchetypeId;
use super::bitmap::Bitmap;
use super::filter::Filter;
use super::world_state::WorldState;
use crate::error::QueryError;

/// One result row.
pub type QueryRow = Map<String, Value>;

/// How `find` selects archetypes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Archetypes with exactly the `find` components.
    #[default]
    Exact,
    /// Archetypes with at least the `find` components.
    Contains,
    /// Every archetype. `find` must be empty.
    All,
}

/// Query parameters as received from the service layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryParams {
    /// Component names.
    pub find: Vec<String>,
    /// Archetype selection.
    #[serde(rename = "match")]
    pub match_kind: MatchKind,
    /// Optional boolean filter over each row.
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
    /// Maximum rows returned. 0 is unlimited.
    pub limit: u32,
    /// Matching rows skipped before collecting.
    pub offset: u32,
}

impl QueryParams {
    /// Query for every entity.
    #[must_use]
    pub fn all() -> Self {
        Self {
            match_kind: MatchKind::All,
            ..Self::default()
        }
    }

    /// Query over the named components.
    #[must_use]
    pub fn find<I, S>(match_kind: MatchKind, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            find: names.into_iter().map(Into::into).collect(),
            match_kind,
            ..Self::default()
        }
    }

    /// Sets the where clause.
    #[must_use]
    pub fn with_where(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    /// Sets limit and offset.
    #[must_use]
    pub const fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

fn select_archetypes(state: &WorldState, params: &QueryParams) -> Result<Vec<ArchetypeId>, QueryError> {
    if params.match_kind == MatchKind::All {
        if !params.find.is_empty() {
            return Err(QueryError::InvalidParams("`find` must be empty when match is all".to_string()));
        }
        return Ok((0..state.archetypes().len()).collect());
    }
    if params.find.is_empty() {
        return Err(QueryError::InvalidParams("`find` must name at least one component".to_string()));
    }

    let mut components = Bitmap::new();
    for name in &params.find {
        let id = state
            .registry()
            .id_of(name)
            .ok_or_else(|| QueryError::InvalidParams(format!("component {name} is not registered")))?;
        components.set(id);
    }
    Ok(match params.match_kind {
        MatchKind::Exact => state.archetype_exact(&components).into_iter().collect(),
        _ => state.archetypes_containing(&components),
    })
}

/// Runs a query.
///
/// # Errors
///
/// - [`QueryError::InvalidParams`] for an inconsistent `find`/`match` pair
///   or an unregistered component name
/// - [`QueryError::Parse`] for a malformed where clause
/// - [`QueryError::Eval`] if the where clause fails on any row
pub fn execute(state: &WorldState, params: &QueryParams) -> Result<Vec<QueryRow>, QueryError> {
    let filter = params
        .where_clause
        .as_deref()
        .filter(|clause| !clause.trim().is_empty())
        .map(Filter::parse)
        .transpose()?;
    let archetypes = select_archetypes(state, params)?;
    let limit = if params.limit == 0 {
        usize::MAX
    } else {
        params.limit as usize
    };

    let mut rows = Vec::new();
    let mut skipped = 0u32;
    for id in archetypes {
        let archetype = &state.archetypes()[id];
        for (row, entity) in archetype.entities().iter().enumerate() {
            let mut fields = Map::new();
            fields.insert("_id".to_string(), Value::from(entity.get()));
            for column in archetype.columns() {
                let value = column
                    .row_to_json(row)
                    .ok_or_else(|| QueryError::Encode(column.name().to_string()))?;
                fields.insert(column.name().to_string(), value);
            }
            let candidate = Value::Object(fields);

            if let Some(filter) = &filter {
                if !filter.matches(&candidate)? {
                    continue;
                }
            }
            if skipped < params.offset {
                skipped += 1;
                continue;
            }
            if let Value::Object(fields) = candidate {
                rows.push(fields);
            }
            if rows.len() >= limit {
                return Ok(rows);
            }
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::component::Component;
    use serde_json::json;

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Health {
        hp: u32,
    }
    impl Component for Health {
        const NAME: &'static str = "health";
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Name(String);
    impl Component for Name {
        const NAME: &'static str = "name";
    }

    fn world() -> WorldState {
        let mut state = WorldState::new();
        state.spawn((Health { hp: 100 },)).unwrap();
        state.spawn((Health { hp: 300 }, Name("boss".into()))).unwrap();
        state.spawn((Health { hp: 50 },)).unwrap();
        state.spawn((Name("sign".into()),)).unwrap();
        state
    }

    #[test]
    fn test_exact_and_contains() {
        let state = world();
        let exact = execute(&state, &QueryParams::find(MatchKind::Exact, ["health"])).unwrap();
        assert_eq!(exact.len(), 2);
        assert_eq!(Value::Object(exact[0].clone()), json!({"_id": 0, "health": {"hp": 100}}));

        let contains = execute(&state, &QueryParams::find(MatchKind::Contains, ["health"])).unwrap();
        let ids: Vec<_> = contains.iter().map(|r| r["_id"].clone()).collect();
        assert_eq!(ids, vec![json!(0), json!(2), json!(1)]);
    }

    #[test]
    fn test_all_with_filter_and_paging() {
        let state = world();
        let params = QueryParams::all().with_where("health.hp >= 100");
        let rows = execute(&state, &params).unwrap();
        assert_eq!(rows.len(), 2);

        let paged = execute(&state, &QueryParams::all().page(2, 1)).unwrap();
        let ids: Vec<_> = paged.iter().map(|r| r["_id"].clone()).collect();
        assert_eq!(ids, vec![json!(2), json!(1)]);
    }

    #[test]
    fn test_invalid_params() {
        let state = world();
        let mut params = QueryParams::all();
        params.find.push("health".into());
        assert!(matches!(execute(&state, &params), Err(QueryError::InvalidParams(_))));
        assert!(matches!(
            execute(&state, &QueryParams::find(MatchKind::Exact, Vec::<String>::new())),
            Err(QueryError::InvalidParams(_))
        ));
        assert!(matches!(
            execute(&state, &QueryParams::find(MatchKind::Contains, ["mana"])),
            Err(QueryError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_deeply_nested_where_is_a_parse_error() {
        let params = QueryParams::all().with_where("(".repeat(10_000));
        assert!(matches!(execute(&world(), &params), Err(QueryError::Parse { .. })));
    }

    #[test]
    fn test_params_from_json() {
        let params: QueryParams =
            serde_json::from_value(json!({"find": ["health"], "match": "contains", "where": "_id > 0", "limit": 1}))
                .unwrap();
        assert_eq!(params.match_kind, MatchKind::Contains);
        let rows = execute(&world(), &params).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["_id"], json!(2));
    }
}
