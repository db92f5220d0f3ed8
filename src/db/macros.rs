//! Backend dispatch macros.
//!
//! sqlx exposes `rows_affected` on each backend's own result type with no
//! shared trait, so statement execution is generated per backend instead of
//! written as one generic function.

/// Run `$sql` on an sqlx executor and build a [`QueryResult`].
///
/// `$executor` is expanded at each use, which lets a transaction pass
/// `&mut **tx` and reborrow for the follow-up count query. Errors are
/// propagated with `?` from the enclosing function.
///
/// ```ignore
/// let result = run_statement!(pool, sql, returns_rows, find_count, row_limit);
/// ```
///
/// [`QueryResult`]: crate::models::QueryResult
macro_rules! run_statement {
    ($executor:expr, $sql:expr, $returns_rows:expr, $find_count:expr, $row_limit:expr) => {{
        use futures_util::StreamExt as _;
        use sqlx::Executor as _;
        use sqlx::Row as _;

        let sql: &str = $sql;
        let row_limit: u32 = $row_limit;
        if $returns_rows {
            let fetch_limit = row_limit as usize + 1;
            let results = ($executor)
                .fetch(sql)
                .take(fetch_limit)
                .collect::<Vec<_>>()
                .await;
            let rows = $crate::db::sql::collect_rows(results)?;
            let mut result = $crate::db::sql::process_rows(rows, row_limit);
            if $find_count {
                let count_sql = $crate::db::sql::count_query(sql);
                let row = ($executor).fetch_one(count_sql.as_str()).await?;
                let count: i64 = row.try_get(0)?;
                result = result.with_count(count.max(0) as u64);
            }
            result
        } else {
            let done = ($executor).execute(sql).await?;
            $crate::models::QueryResult::affected(done.rows_affected())
        }
    }};
}

pub(crate) use run_statement;
