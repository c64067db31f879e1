// Table definitions for the persistent store.
// Timestamps are RFC 3339 text; UUIDs are stored as text.

diesel::table! {
    source_documents (uuid) {
        uuid -> Text,
        project_uuid -> Text,
        blob_location -> Text,
        original_filename -> Nullable<Text>,
        content_hash -> Nullable<Text>,
        file_size -> Nullable<BigInt>,
        mime_type -> Nullable<Text>,
        status -> Text,
        current_stage -> Nullable<Text>,
        ocr_job_id -> Nullable<Text>,
        raw_text -> Nullable<Text>,
        error -> Nullable<Text>,
        page_count -> Integer,
        chunk_count -> Integer,
        entity_count -> Integer,
        metadata -> Text,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    document_chunks (uuid) {
        uuid -> Text,
        document_uuid -> Text,
        chunk_index -> Integer,
        text -> Text,
        char_start -> BigInt,
        char_end -> BigInt,
        page_start -> Nullable<Integer>,
        page_end -> Nullable<Integer>,
        metadata -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    entity_mentions (uuid) {
        uuid -> Text,
        document_uuid -> Text,
        chunk_uuid -> Text,
        chunk_index -> Integer,
        text -> Text,
        entity_type -> Text,
        confidence -> Float,
        start_offset -> Integer,
        end_offset -> Integer,
        canonical_entity_uuid -> Nullable<Text>,
        unresolved_reason -> Nullable<Text>,
        extraction_method -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    canonical_entities (uuid) {
        uuid -> Text,
        document_uuid -> Text,
        entity_type -> Text,
        canonical_name -> Text,
        aliases -> Text,
        mention_count -> Integer,
        confidence -> Float,
        created_at -> Text,
    }
}

diesel::table! {
    relationship_staging (uuid) {
        uuid -> Text,
        document_uuid -> Text,
        from_entity_uuid -> Text,
        to_entity_uuid -> Text,
        rel_type -> Text,
        confidence -> Float,
        evidence_chunk_uuid -> Nullable<Text>,
        evidence_text -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    processing_tasks (id) {
        id -> Text,
        document_id -> Text,
        task_type -> Text,
        status -> Text,
        error_message -> Nullable<Text>,
        retry_count -> Integer,
        created_at -> Text,
        started_at -> Nullable<Text>,
        completed_at -> Nullable<Text>,
    }
}

diesel::table! {
    textract_jobs (job_id) {
        job_id -> Text,
        document_uuid -> Text,
        status -> Text,
        page_count -> Nullable<Integer>,
        error -> Nullable<Text>,
        result_location -> Nullable<Text>,
        submitted_at -> Text,
        updated_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    source_documents,
    document_chunks,
    entity_mentions,
    canonical_entities,
    relationship_staging,
    processing_tasks,
    textract_jobs,
);
