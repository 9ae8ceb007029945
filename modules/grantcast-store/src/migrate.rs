use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

/// Run idempotent schema migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    info!("Running schema migrations...");

    let statements = [
        "CREATE TABLE IF NOT EXISTS kv_cache (
             key TEXT PRIMARY KEY,
             value TEXT NOT NULL,
             expires_at TIMESTAMPTZ
         )",
        "CREATE TABLE IF NOT EXISTS jobs (
             id UUID PRIMARY KEY,
             queue TEXT NOT NULL,
             payload JSONB NOT NULL,
             attempts INT NOT NULL DEFAULT 0,
             progress SMALLINT NOT NULL DEFAULT 0,
             enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now(),
             locked_until TIMESTAMPTZ,
             completed_at TIMESTAMPTZ,
             dead_at TIMESTAMPTZ,
             last_error TEXT
         )",
        "CREATE INDEX IF NOT EXISTS jobs_claim_idx
             ON jobs (queue, enqueued_at)
             WHERE completed_at IS NULL AND dead_at IS NULL",
        "CREATE TABLE IF NOT EXISTS embeddings (
             id UUID PRIMARY KEY,
             content_type TEXT NOT NULL,
             content TEXT NOT NULL,
             raw_content TEXT,
             content_hash TEXT NOT NULL UNIQUE,
             embedding REAL[] NOT NULL,
             groups TEXT[] NOT NULL DEFAULT '{}',
             users TEXT[] NOT NULL DEFAULT '{}',
             tags TEXT[] NOT NULL DEFAULT '{}',
             external_id TEXT NOT NULL,
             external_url TEXT,
             urls TEXT[] NOT NULL DEFAULT '{}',
             url_summaries TEXT[] NOT NULL DEFAULT '{}',
             version INT NOT NULL,
             created_at TIMESTAMPTZ NOT NULL DEFAULT now()
         )",
        "CREATE INDEX IF NOT EXISTS embeddings_external_idx
             ON embeddings (content_type, external_id)",
        "CREATE TABLE IF NOT EXISTS casts (
             id BIGINT PRIMARY KEY,
             hash TEXT NOT NULL UNIQUE,
             fid BIGINT NOT NULL,
             text TEXT NOT NULL DEFAULT '',
             parent_hash TEXT,
             grant_id TEXT,
             embeds TEXT[] NOT NULL DEFAULT '{}',
             tags TEXT[] NOT NULL DEFAULT '{}',
             impact_verifications JSONB NOT NULL DEFAULT '[]',
             story_ids UUID[] NOT NULL DEFAULT '{}',
             timestamp TIMESTAMPTZ NOT NULL
         )",
        "CREATE INDEX IF NOT EXISTS casts_fid_idx ON casts (fid)",
        "CREATE TABLE IF NOT EXISTS profiles (
             fid BIGINT PRIMARY KEY,
             fname TEXT,
             display_name TEXT,
             bio TEXT,
             verified_addresses TEXT[] NOT NULL DEFAULT '{}'
         )",
        "CREATE TABLE IF NOT EXISTS grants (
             id TEXT PRIMARY KEY,
             title TEXT NOT NULL DEFAULT '',
             description TEXT NOT NULL DEFAULT '',
             recipient_address TEXT NOT NULL,
             parent_contract TEXT
         )",
        "CREATE INDEX IF NOT EXISTS grants_recipient_idx
             ON grants (lower(recipient_address))",
        "CREATE TABLE IF NOT EXISTS stories (
             id UUID PRIMARY KEY,
             grant_id TEXT NOT NULL,
             title TEXT NOT NULL,
             tagline TEXT NOT NULL,
             summary TEXT NOT NULL DEFAULT '',
             key_points TEXT[] NOT NULL DEFAULT '{}',
             participants TEXT[] NOT NULL DEFAULT '{}',
             timeline TEXT[] NOT NULL DEFAULT '{}',
             sentiment TEXT NOT NULL DEFAULT 'neutral',
             completeness DOUBLE PRECISION NOT NULL DEFAULT 0,
             complete BOOLEAN NOT NULL DEFAULT false,
             sources TEXT[] NOT NULL DEFAULT '{}',
             media_urls TEXT[] NOT NULL DEFAULT '{}',
             header_image TEXT,
             cast_hashes TEXT[] NOT NULL DEFAULT '{}',
             edits JSONB NOT NULL DEFAULT '[]',
             info_needed_to_complete TEXT,
             mint_urls TEXT[] NOT NULL DEFAULT '{}',
             author TEXT,
             created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
             UNIQUE (grant_id, title, tagline)
         )",
        "CREATE TABLE IF NOT EXISTS token_metadata (
             url TEXT PRIMARY KEY,
             name TEXT NOT NULL DEFAULT '',
             description TEXT NOT NULL DEFAULT '',
             image_url TEXT,
             animation_url TEXT
         )",
    ];

    for statement in &statements {
        sqlx::query(statement).execute(pool).await?;
    }

    info!("Schema migrations complete");
    Ok(())
}
