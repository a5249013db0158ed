//! Diesel table definitions for the inventory store.
//!
//! Tables: vcs_instances, groups, repositories, registries, images, users,
//! repository_users, contributors, findings. Every table except
//! vcs_instances is scoped by vcs_instance_id and carries a unique index on
//! its natural key (see `migration.rs`).

diesel::table! {
    vcs_instances (id) {
        id -> Int8,
        url -> Text,
        vcs_type -> Text,
        mnemonic -> Text,
    }
}

diesel::table! {
    groups (id) {
        id -> Int8,
        vcs_instance_id -> Int8,
        vcs_id -> Int8,
        parent_id -> Nullable<Int8>,
        path -> Text,
        visibility -> Text,
    }
}

diesel::table! {
    repositories (id) {
        id -> Int8,
        vcs_instance_id -> Int8,
        vcs_id -> Int8,
        path -> Text,
        group_id -> Int8,
        parents -> Nullable<Array<Int8>>,
        web_url -> Text,
        git_url -> Text,
        forks_count -> Int4,
        created -> Nullable<Timestamptz>,
        default_branch -> Nullable<Text>,
        visibility -> Text,
        is_archived -> Bool,
        last_activity -> Timestamptz,
        last_commit_at -> Nullable<Timestamptz>,
        last_time_checked -> Timestamptz,
        last_time_scanned -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    registries (id) {
        id -> Int8,
        vcs_instance_id -> Int8,
        vcs_id -> Int8,
        repo_id -> Int8,
        path -> Text,
        name -> Text,
        location -> Text,
        created_at -> Nullable<Timestamptz>,
        last_time_checked -> Timestamptz,
    }
}

diesel::table! {
    images (id) {
        id -> Int8,
        vcs_instance_id -> Int8,
        image -> Text,
        repo_id -> Int8,
        registry_id -> Int8,
        path -> Text,
        tag -> Text,
        digest -> Nullable<Text>,
        revision -> Nullable<Text>,
        total_size -> Nullable<Int8>,
        created_at -> Nullable<Timestamptz>,
        last_time_checked -> Timestamptz,
    }
}

diesel::table! {
    users (id) {
        id -> Int8,
        vcs_instance_id -> Int8,
        vcs_id -> Int8,
        username -> Text,
        name -> Text,
        state -> Text,
        locked -> Bool,
        web_url -> Text,
    }
}

diesel::table! {
    repository_users (id) {
        id -> Int8,
        vcs_instance_id -> Int8,
        repo_id -> Int8,
        user_id -> Int8,
        access_level -> Text,
    }
}

diesel::table! {
    contributors (id) {
        id -> Int8,
        vcs_instance_id -> Int8,
        repo_id -> Int8,
        email -> Text,
        commits -> Int8,
        additions -> Int8,
        deletions -> Int8,
    }
}

diesel::table! {
    findings (id) {
        id -> Int8,
        vcs_instance_id -> Int8,
        repo_id -> Int8,
        tool -> Text,
        rule_id -> Text,
        title -> Text,
        fingerprint -> Text,
        cwe -> Nullable<Int4>,
        severity -> Text,
        author -> Nullable<Text>,
        email -> Nullable<Text>,
        file_path -> Text,
        line -> Int4,
        commit -> Nullable<Text>,
        commit_date -> Nullable<Timestamptz>,
        commit_message -> Nullable<Text>,
        found_date -> Timestamptz,
        entropy -> Nullable<Float8>,
        secret -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    vcs_instances,
    groups,
    repositories,
    registries,
    images,
    users,
    repository_users,
    contributors,
    findings,
);
