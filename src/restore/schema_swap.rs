// restoretool/src/restore/schema_swap.rs
//! Moves every relation from one schema to another.
//!
//! `public` is the live schema, `restore` holds freshly loaded data and
//! `backup` holds the previous live data until the next restore. Rolling
//! back first sets whatever is in `public` aside into `restore`, so the old
//! live data comes back without leftovers. A swap
//! drops same-named relations in the destination (using whatever kind they
//! have there) and then moves the source relation with `SET SCHEMA`.
//! Sequences owned by a column travel with their table.

use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use std::fmt;

use crate::errors::{RestoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    Public,
    Backup,
    Restore,
}

impl Schema {
    pub fn as_str(&self) -> &'static str {
        match self {
            Schema::Public => "public",
            Schema::Backup => "backup",
            Schema::Restore => "restore",
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapFlow {
    /// public -> backup
    MakeRoom,
    /// restore -> public
    Promote,
    /// public -> restore
    SetAside,
    /// backup -> public
    Rollback,
}

/// Puts the previous live data back: `public` is emptied into `restore` first.
pub const ROLLBACK_FLOWS: [SwapFlow; 2] = [SwapFlow::SetAside, SwapFlow::Rollback];

impl SwapFlow {
    pub fn schemas(&self) -> (Schema, Schema) {
        match self {
            SwapFlow::MakeRoom => (Schema::Public, Schema::Backup),
            SwapFlow::Promote => (Schema::Restore, Schema::Public),
            SwapFlow::SetAside => (Schema::Public, Schema::Restore),
            SwapFlow::Rollback => (Schema::Backup, Schema::Public),
        }
    }
}

impl fmt::Display for SwapFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (source, dest) = self.schemas();
        write!(f, "{} -> {}", source, dest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    Table,
    Sequence,
    View,
    MaterializedView,
}

impl RelationKind {
    /// Maps `pg_class.relkind`.
    pub fn from_relkind(relkind: &str) -> Option<Self> {
        match relkind {
            "r" | "p" => Some(RelationKind::Table),
            "S" => Some(RelationKind::Sequence),
            "v" => Some(RelationKind::View),
            "m" => Some(RelationKind::MaterializedView),
            _ => None,
        }
    }

    fn keyword(&self) -> &'static str {
        match self {
            RelationKind::Table => "TABLE",
            RelationKind::Sequence => "SEQUENCE",
            RelationKind::View => "VIEW",
            RelationKind::MaterializedView => "MATERIALIZED VIEW",
        }
    }

    fn move_order(&self) -> u8 {
        match self {
            RelationKind::Table => 0,
            RelationKind::Sequence => 1,
            RelationKind::View => 2,
            RelationKind::MaterializedView => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub name: String,
    pub kind: RelationKind,
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Relations that can be moved independently; owned sequences are left out.
const RELATIONS_QUERY: &str = r#"
    SELECT c.relname::text, c.relkind::text
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1
      AND c.relkind IN ('r', 'p', 'S', 'v', 'm')
      AND NOT (
        c.relkind = 'S' AND EXISTS (
          SELECT 1 FROM pg_depend d
          WHERE d.classid = 'pg_class'::regclass
            AND d.objid = c.oid
            AND d.deptype IN ('a', 'i')
        )
      )
"#;

pub async fn list_relations(conn: &mut PgConnection, schema: Schema) -> Result<Vec<Relation>> {
    let rows: Vec<(String, String)> = sqlx::query_as(RELATIONS_QUERY)
        .bind(schema.as_str())
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|(name, relkind)| {
            RelationKind::from_relkind(&relkind).map(|kind| Relation { name, kind })
        })
        .collect())
}

/// Statements that move `source_relations` from `source` into `dest`.
pub fn plan_moves(
    flow: SwapFlow,
    source_relations: &[Relation],
    dest_relations: &[Relation],
) -> Vec<String> {
    let (source, dest) = flow.schemas();
    let existing: HashMap<&str, RelationKind> = dest_relations
        .iter()
        .map(|r| (r.name.as_str(), r.kind))
        .collect();

    let mut ordered: Vec<&Relation> = source_relations.iter().collect();
    ordered.sort_by(|a, b| {
        a.kind
            .move_order()
            .cmp(&b.kind.move_order())
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut statements = vec![format!(
        "CREATE SCHEMA IF NOT EXISTS {}",
        quote_ident(dest.as_str())
    )];
    for relation in ordered {
        let name = quote_ident(&relation.name);
        if let Some(kind) = existing.get(relation.name.as_str()) {
            statements.push(format!(
                "DROP {} IF EXISTS {}.{} CASCADE",
                kind.keyword(),
                quote_ident(dest.as_str()),
                name
            ));
        }
        statements.push(format!(
            "ALTER {} {}.{} SET SCHEMA {}",
            relation.kind.keyword(),
            quote_ident(source.as_str()),
            name,
            quote_ident(dest.as_str())
        ));
    }
    statements
}

/// Performs one flow on an open connection or transaction.
pub async fn move_relations(conn: &mut PgConnection, flow: SwapFlow) -> Result<usize> {
    let (source, dest) = flow.schemas();
    let source_relations = list_relations(conn, source).await?;
    let dest_relations = list_relations(conn, dest).await?;

    for statement in plan_moves(flow, &source_relations, &dest_relations) {
        sqlx::query(&statement)
            .execute(&mut *conn)
            .await
            .map_err(|e| RestoreError::SchemaSwap(format!("{} ({}): {}", flow, statement, e)))?;
    }
    Ok(source_relations.len())
}

/// Runs all `flows` in one transaction: either every relation moves or none does.
pub async fn swap_in_transaction(pool: &PgPool, flows: &[SwapFlow]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for flow in flows {
        let moved = move_relations(&mut *tx, *flow).await?;
        tracing::info!("Moved {} relations {}", moved, flow);
    }
    tx.commit().await?;
    Ok(())
}

pub async fn relation_count(pool: &PgPool, schema: Schema) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1 AND c.relkind IN ('r', 'p')
        "#,
    )
    .bind(schema.as_str())
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(name: &str, kind: RelationKind) -> Relation {
        Relation {
            name: name.to_string(),
            kind,
        }
    }

    #[test]
    fn test_flow_directions() {
        assert_eq!(SwapFlow::MakeRoom.schemas(), (Schema::Public, Schema::Backup));
        assert_eq!(SwapFlow::Promote.schemas(), (Schema::Restore, Schema::Public));
        assert_eq!(SwapFlow::Rollback.schemas(), (Schema::Backup, Schema::Public));
        assert_eq!(SwapFlow::SetAside.schemas(), (Schema::Public, Schema::Restore));
        assert_eq!(SwapFlow::Promote.to_string(), "restore -> public");
    }

    #[test]
    fn test_rollback_sets_leftovers_aside_before_moving_backup() {
        let public = vec![
            rel("users", RelationKind::Table),
            rel("added_by_migration", RelationKind::Table),
        ];
        let restore = vec![rel("users", RelationKind::Table)];
        let backup = vec![rel("users", RelationKind::Table)];

        let [first, second] = ROLLBACK_FLOWS;
        let set_aside = plan_moves(first, &public, &restore);
        assert_eq!(
            set_aside,
            vec![
                r#"CREATE SCHEMA IF NOT EXISTS "restore""#,
                r#"ALTER TABLE "public"."added_by_migration" SET SCHEMA "restore""#,
                r#"DROP TABLE IF EXISTS "restore"."users" CASCADE"#,
                r#"ALTER TABLE "public"."users" SET SCHEMA "restore""#,
            ]
        );

        // Within the transaction `public` is empty by now, so nothing is dropped there.
        let rollback = plan_moves(second, &backup, &[]);
        assert_eq!(
            rollback,
            vec![
                r#"CREATE SCHEMA IF NOT EXISTS "public""#,
                r#"ALTER TABLE "backup"."users" SET SCHEMA "public""#,
            ]
        );
    }

    #[test]
    fn test_plan_moves_tables_before_views_and_drops_collisions_by_dest_kind() {
        let source = vec![
            rel("top_topics", RelationKind::View),
            rel("users", RelationKind::Table),
            rel("badge_seq", RelationKind::Sequence),
        ];
        let dest = vec![
            rel("users", RelationKind::Table),
            rel("top_topics", RelationKind::MaterializedView),
            rel("unrelated", RelationKind::Table),
        ];

        let statements = plan_moves(SwapFlow::MakeRoom, &source, &dest);
        assert_eq!(
            statements,
            vec![
                r#"CREATE SCHEMA IF NOT EXISTS "backup""#,
                r#"DROP TABLE IF EXISTS "backup"."users" CASCADE"#,
                r#"ALTER TABLE "public"."users" SET SCHEMA "backup""#,
                r#"ALTER SEQUENCE "public"."badge_seq" SET SCHEMA "backup""#,
                r#"DROP MATERIALIZED VIEW IF EXISTS "backup"."top_topics" CASCADE"#,
                r#"ALTER VIEW "public"."top_topics" SET SCHEMA "backup""#,
            ]
        );
    }

    #[test]
    fn test_plan_moves_with_empty_source_only_creates_schema() {
        let statements = plan_moves(SwapFlow::Rollback, &[], &[rel("users", RelationKind::Table)]);
        assert_eq!(statements, vec![r#"CREATE SCHEMA IF NOT EXISTS "public""#]);
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
        assert_eq!(RelationKind::from_relkind("p"), Some(RelationKind::Table));
        assert_eq!(RelationKind::from_relkind("i"), None);
    }
}
