//! SQL statements, one set per dialect.
//!
//! Both sets take their parameters in the same order so the binding code
//! is shared; only placeholder syntax and locking clauses differ.

/// Statements against the `builds` table.
#[derive(Debug)]
pub struct BuildQueries {
    /// `(repo_id, number, event, branch, status, created_at)`
    pub insert: &'static str,
    /// `(repo_id)`; bumps and returns the repository's high-water mark
    pub next_number: &'static str,
    /// `(repo_id, number)`; lifts the high-water mark to at least `number`
    pub raise_number: &'static str,
    /// `(repo_id, number)`
    pub select_repo_build: &'static str,
    /// `(id)`
    pub select_by_id: &'static str,
    /// `(repo_id)`
    pub select_last: &'static str,
    /// `(repo_id, branch)`
    pub select_last_by_branch: &'static str,
    /// `(repo_id, limit, offset)`
    pub list_repo: &'static str,
    /// `(repo_id, event, limit, offset)`
    pub list_repo_by_event: &'static str,
    pub list_all: &'static str,
    pub count: &'static str,
    /// `(status)`
    pub count_by_status: &'static str,
    /// `(repo_id)`
    pub count_by_repo: &'static str,
    /// `(repo_id, event)`
    pub count_by_repo_and_event: &'static str,
    /// `(event, branch, status, route, error, enqueued_at, started_at, finished_at, id)`
    pub update: &'static str,
    /// `(status, error, started_at, finished_at, id, expected_status)`
    pub update_status: &'static str,
    /// `(route, id)`
    pub set_route: &'static str,
    /// `(enqueued_at, id)`
    pub mark_enqueued: &'static str,
    /// `(id)`
    pub delete: &'static str,
}

/// Statements against the `queue_messages` table.
#[derive(Debug)]
pub struct QueueQueries {
    /// `(route, payload, created_at)`
    pub push: &'static str,
    /// `(route)`
    pub pop: &'static str,
    /// `(route)`
    pub length: &'static str,
}

pub mod postgres {
    use super::{BuildQueries, QueueQueries};

    pub static BUILDS: BuildQueries = BuildQueries {
        insert: r#"
            INSERT INTO builds (repo_id, number, event, branch, status, route, error, created_at)
            VALUES ($1, $2, $3, $4, $5, '', '', $6)
            RETURNING *
        "#,
        next_number: r#"
            INSERT INTO build_numbers (repo_id, last_number)
            VALUES ($1, 1)
            ON CONFLICT (repo_id) DO UPDATE SET last_number = build_numbers.last_number + 1
            RETURNING last_number
        "#,
        raise_number: r#"
            INSERT INTO build_numbers (repo_id, last_number)
            VALUES ($1, $2)
            ON CONFLICT (repo_id) DO UPDATE
            SET last_number = GREATEST(build_numbers.last_number, EXCLUDED.last_number)
        "#,
        select_repo_build: "SELECT * FROM builds WHERE repo_id = $1 AND number = $2 LIMIT 1",
        select_by_id: "SELECT * FROM builds WHERE id = $1",
        select_last: "SELECT * FROM builds WHERE repo_id = $1 ORDER BY number DESC LIMIT 1",
        select_last_by_branch: r#"
            SELECT * FROM builds
            WHERE repo_id = $1 AND branch = $2
            ORDER BY number DESC
            LIMIT 1
        "#,
        list_repo: r#"
            SELECT * FROM builds
            WHERE repo_id = $1
            ORDER BY number DESC
            LIMIT $2 OFFSET $3
        "#,
        list_repo_by_event: r#"
            SELECT * FROM builds
            WHERE repo_id = $1 AND event = $2
            ORDER BY number DESC
            LIMIT $3 OFFSET $4
        "#,
        list_all: "SELECT * FROM builds ORDER BY id",
        count: "SELECT COUNT(*) FROM builds",
        count_by_status: "SELECT COUNT(*) FROM builds WHERE status = $1",
        count_by_repo: "SELECT COUNT(*) FROM builds WHERE repo_id = $1",
        count_by_repo_and_event: "SELECT COUNT(*) FROM builds WHERE repo_id = $1 AND event = $2",
        update: r#"
            UPDATE builds
            SET event = $1, branch = $2, status = $3, route = $4, error = $5,
                enqueued_at = $6, started_at = $7, finished_at = $8
            WHERE id = $9
            RETURNING *
        "#,
        update_status: r#"
            UPDATE builds
            SET status = $1,
                error = COALESCE($2, error),
                started_at = COALESCE(started_at, $3),
                finished_at = COALESCE(finished_at, $4)
            WHERE id = $5 AND status = $6
            RETURNING *
        "#,
        set_route: "UPDATE builds SET route = $1 WHERE id = $2 RETURNING *",
        mark_enqueued: r#"
            UPDATE builds
            SET enqueued_at = COALESCE(enqueued_at, $1)
            WHERE id = $2
            RETURNING *
        "#,
        delete: "DELETE FROM builds WHERE id = $1",
    };

    pub static QUEUE: QueueQueries = QueueQueries {
        push: "INSERT INTO queue_messages (route, payload, created_at) VALUES ($1, $2, $3)",
        // SKIP LOCKED lets concurrent workers on different nodes pop
        // without contending for the same row.
        pop: r#"
            DELETE FROM queue_messages
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE route = $1
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING payload
        "#,
        length: "SELECT COUNT(*) FROM queue_messages WHERE route = $1",
    };
}

pub mod sqlite {
    use super::{BuildQueries, QueueQueries};

    pub static BUILDS: BuildQueries = BuildQueries {
        insert: r#"
            INSERT INTO builds (repo_id, number, event, branch, status, route, error, created_at)
            VALUES (?, ?, ?, ?, ?, '', '', ?)
            RETURNING *
        "#,
        next_number: r#"
            INSERT INTO build_numbers (repo_id, last_number)
            VALUES (?, 1)
            ON CONFLICT (repo_id) DO UPDATE SET last_number = build_numbers.last_number + 1
            RETURNING last_number
        "#,
        raise_number: r#"
            INSERT INTO build_numbers (repo_id, last_number)
            VALUES (?, ?)
            ON CONFLICT (repo_id) DO UPDATE
            SET last_number = MAX(build_numbers.last_number, excluded.last_number)
        "#,
        select_repo_build: "SELECT * FROM builds WHERE repo_id = ? AND number = ? LIMIT 1",
        select_by_id: "SELECT * FROM builds WHERE id = ?",
        select_last: "SELECT * FROM builds WHERE repo_id = ? ORDER BY number DESC LIMIT 1",
        select_last_by_branch: r#"
            SELECT * FROM builds
            WHERE repo_id = ? AND branch = ?
            ORDER BY number DESC
            LIMIT 1
        "#,
        list_repo: r#"
            SELECT * FROM builds
            WHERE repo_id = ?
            ORDER BY number DESC
            LIMIT ? OFFSET ?
        "#,
        list_repo_by_event: r#"
            SELECT * FROM builds
            WHERE repo_id = ? AND event = ?
            ORDER BY number DESC
            LIMIT ? OFFSET ?
        "#,
        list_all: "SELECT * FROM builds ORDER BY id",
        count: "SELECT COUNT(*) FROM builds",
        count_by_status: "SELECT COUNT(*) FROM builds WHERE status = ?",
        count_by_repo: "SELECT COUNT(*) FROM builds WHERE repo_id = ?",
        count_by_repo_and_event: "SELECT COUNT(*) FROM builds WHERE repo_id = ? AND event = ?",
        update: r#"
            UPDATE builds
            SET event = ?, branch = ?, status = ?, route = ?, error = ?,
                enqueued_at = ?, started_at = ?, finished_at = ?
            WHERE id = ?
            RETURNING *
        "#,
        update_status: r#"
            UPDATE builds
            SET status = ?,
                error = COALESCE(?, error),
                started_at = COALESCE(started_at, ?),
                finished_at = COALESCE(finished_at, ?)
            WHERE id = ? AND status = ?
            RETURNING *
        "#,
        set_route: "UPDATE builds SET route = ? WHERE id = ? RETURNING *",
        mark_enqueued: r#"
            UPDATE builds
            SET enqueued_at = COALESCE(enqueued_at, ?)
            WHERE id = ?
            RETURNING *
        "#,
        delete: "DELETE FROM builds WHERE id = ?",
    };

    pub static QUEUE: QueueQueries = QueueQueries {
        push: "INSERT INTO queue_messages (route, payload, created_at) VALUES (?, ?, ?)",
        pop: r#"
            DELETE FROM queue_messages
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE route = ?
                ORDER BY id
                LIMIT 1
            )
            RETURNING payload
        "#,
        length: "SELECT COUNT(*) FROM queue_messages WHERE route = ?",
    };
}
