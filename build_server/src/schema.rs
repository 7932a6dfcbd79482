//! Diesel table definitions for the build engine.
//!
//! Tables: builds (one document per build id), build_jobs (the durable
//! queue), deployments (status mirror owned by the deploy service).

diesel::table! {
    builds (build_id) {
        build_id -> Varchar,
        deployment_id -> Varchar,
        project_id -> Varchar,
        status -> Varchar,
        rebuild_from -> Nullable<Varchar>,
        request -> Jsonb,
        stages -> Jsonb,
        cache -> Jsonb,
        artifacts -> Jsonb,
        error -> Nullable<Jsonb>,
        retry_count -> Int4,
        max_retries -> Int4,
        created_at -> Timestamptz,
        started_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        duration_ms -> Nullable<Int8>,
    }
}

diesel::table! {
    build_jobs (id) {
        id -> Int8,
        build_id -> Varchar,
        payload -> Jsonb,
        state -> Varchar,
        attempts -> Int4,
        max_attempts -> Int4,
        progress -> Int4,
        run_at -> Timestamptz,
        claimed_by -> Nullable<Varchar>,
        heartbeat_at -> Nullable<Timestamptz>,
        last_error -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    deployments (deployment_id) {
        deployment_id -> Varchar,
        project_id -> Varchar,
        status -> Varchar,
        build_id -> Nullable<Varchar>,
        error_message -> Nullable<Text>,
        artifact_path -> Nullable<Varchar>,
        build_started_at -> Nullable<Timestamptz>,
        build_finished_at -> Nullable<Timestamptz>,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(builds, build_jobs, deployments);
