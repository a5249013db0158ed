//! Inventory schema migration, run once at startup.
//!
//! Idempotent: every statement uses `IF NOT EXISTS`. The unique indexes are
//! the conflict targets of the upserts in `store/postgres.rs`.

use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};

pub const MIGRATION_SQL: &str = r#"
-- ================================================================
-- VCS inventory tables
-- ================================================================

CREATE TABLE IF NOT EXISTS vcs_instances (
    id              BIGSERIAL PRIMARY KEY,
    url             TEXT NOT NULL,
    vcs_type        TEXT NOT NULL,
    mnemonic        TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_vcs_instances_url ON vcs_instances (url);

CREATE TABLE IF NOT EXISTS groups (
    id              BIGSERIAL PRIMARY KEY,
    vcs_instance_id BIGINT NOT NULL REFERENCES vcs_instances(id) ON DELETE CASCADE,
    vcs_id          BIGINT NOT NULL,
    parent_id       BIGINT,
    path            TEXT NOT NULL DEFAULT '',
    visibility      TEXT NOT NULL DEFAULT ''
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_groups_natural ON groups (vcs_instance_id, vcs_id);

CREATE TABLE IF NOT EXISTS repositories (
    id                BIGSERIAL PRIMARY KEY,
    vcs_instance_id   BIGINT NOT NULL REFERENCES vcs_instances(id) ON DELETE CASCADE,
    vcs_id            BIGINT NOT NULL,
    path              TEXT NOT NULL,
    group_id          BIGINT NOT NULL,
    parents           BIGINT[],
    web_url           TEXT NOT NULL,
    git_url           TEXT NOT NULL,
    forks_count       INTEGER NOT NULL DEFAULT 0,
    created           TIMESTAMPTZ,
    default_branch    TEXT,
    visibility        TEXT NOT NULL DEFAULT '',
    is_archived       BOOLEAN NOT NULL DEFAULT FALSE,
    last_activity     TIMESTAMPTZ NOT NULL,
    last_commit_at    TIMESTAMPTZ,
    last_time_checked TIMESTAMPTZ NOT NULL,
    last_time_scanned TIMESTAMPTZ
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_repositories_natural ON repositories (vcs_instance_id, vcs_id);

CREATE TABLE IF NOT EXISTS registries (
    id                BIGSERIAL PRIMARY KEY,
    vcs_instance_id   BIGINT NOT NULL REFERENCES vcs_instances(id) ON DELETE CASCADE,
    vcs_id            BIGINT NOT NULL,
    repo_id           BIGINT NOT NULL,
    path              TEXT NOT NULL,
    name              TEXT NOT NULL,
    location          TEXT NOT NULL DEFAULT '',
    created_at        TIMESTAMPTZ,
    last_time_checked TIMESTAMPTZ NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_registries_natural ON registries (vcs_instance_id, vcs_id, repo_id);

CREATE TABLE IF NOT EXISTS images (
    id                BIGSERIAL PRIMARY KEY,
    vcs_instance_id   BIGINT NOT NULL REFERENCES vcs_instances(id) ON DELETE CASCADE,
    image             TEXT NOT NULL,
    repo_id           BIGINT NOT NULL,
    registry_id       BIGINT NOT NULL,
    path              TEXT NOT NULL,
    tag               TEXT NOT NULL,
    digest            TEXT,
    revision          TEXT,
    total_size        BIGINT,
    created_at        TIMESTAMPTZ,
    last_time_checked TIMESTAMPTZ NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_images_natural ON images (vcs_instance_id, image, repo_id, registry_id);
CREATE INDEX IF NOT EXISTS idx_images_registry ON images (vcs_instance_id, repo_id, registry_id);

CREATE TABLE IF NOT EXISTS users (
    id              BIGSERIAL PRIMARY KEY,
    vcs_instance_id BIGINT NOT NULL REFERENCES vcs_instances(id) ON DELETE CASCADE,
    vcs_id          BIGINT NOT NULL,
    username        TEXT NOT NULL,
    name            TEXT NOT NULL DEFAULT '',
    state           TEXT NOT NULL DEFAULT '',
    locked          BOOLEAN NOT NULL DEFAULT FALSE,
    web_url         TEXT NOT NULL DEFAULT ''
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_users_natural ON users (vcs_instance_id, vcs_id);
CREATE UNIQUE INDEX IF NOT EXISTS uq_users_username ON users (vcs_instance_id, username);

CREATE TABLE IF NOT EXISTS repository_users (
    id              BIGSERIAL PRIMARY KEY,
    vcs_instance_id BIGINT NOT NULL REFERENCES vcs_instances(id) ON DELETE CASCADE,
    repo_id         BIGINT NOT NULL,
    user_id         BIGINT NOT NULL,
    access_level    TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_repository_users_natural
    ON repository_users (vcs_instance_id, repo_id, user_id, access_level);

CREATE TABLE IF NOT EXISTS contributors (
    id              BIGSERIAL PRIMARY KEY,
    vcs_instance_id BIGINT NOT NULL REFERENCES vcs_instances(id) ON DELETE CASCADE,
    repo_id         BIGINT NOT NULL,
    email           TEXT NOT NULL,
    commits         BIGINT NOT NULL DEFAULT 0,
    additions       BIGINT NOT NULL DEFAULT 0,
    deletions       BIGINT NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_contributors_natural ON contributors (vcs_instance_id, repo_id, email);

CREATE TABLE IF NOT EXISTS findings (
    id              BIGSERIAL PRIMARY KEY,
    vcs_instance_id BIGINT NOT NULL REFERENCES vcs_instances(id) ON DELETE CASCADE,
    repo_id         BIGINT NOT NULL,
    tool            TEXT NOT NULL,
    rule_id         TEXT NOT NULL,
    title           TEXT NOT NULL,
    fingerprint     TEXT NOT NULL,
    cwe             INTEGER,
    severity        TEXT NOT NULL,
    author          TEXT,
    email           TEXT,
    file_path       TEXT NOT NULL,
    line            INTEGER NOT NULL,
    commit          TEXT,
    commit_date     TIMESTAMPTZ,
    commit_message  TEXT,
    found_date      TIMESTAMPTZ NOT NULL,
    entropy         DOUBLE PRECISION,
    secret          TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS uq_findings_natural ON findings (vcs_instance_id, repo_id, fingerprint);
"#;

/// Create the inventory tables if they do not exist yet.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("inventory migration failed: {e}"))?;
    Ok(())
}
