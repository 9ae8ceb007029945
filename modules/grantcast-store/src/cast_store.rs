use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use grantcast_common::{
    CastRow, ContentType, EmbeddingRecord, Grant, ImpactVerification, Profile, StoryAnalysis,
    TokenMetadata,
};

/// Typed data-access collaborator consumed by the pipeline core.
///
/// The core does not care whether this is one database or several; it only
/// sees these read/write operations.
#[async_trait]
pub trait CastStore: Send + Sync {
    // --- Reads ---
    async fn get_cast_by_hash(&self, hash: &str) -> Result<Option<CastRow>>;
    async fn get_casts_with_parent_for_fid(&self, fid: i64) -> Result<Vec<CastRow>>;
    async fn get_profile_by_fid(&self, fid: i64) -> Result<Option<Profile>>;
    async fn get_grants_for_recipients(&self, addresses: &[String]) -> Result<Vec<Grant>>;
    async fn get_grant_and_parent(&self, grant_id: &str) -> Result<Option<(Grant, Option<Grant>)>>;
    async fn get_stories_for_grant(&self, grant_id: &str) -> Result<Vec<StoryAnalysis>>;
    /// Casts attributed to a grant that no story has absorbed yet.
    async fn get_unassigned_casts_for_grant(&self, grant_id: &str) -> Result<Vec<CastRow>>;
    async fn get_token_metadata_for_url(&self, url: &str) -> Result<Option<TokenMetadata>>;

    // --- Writes ---
    /// Upsert keyed by content_hash. Builder-profile records are further
    /// unique per external_id: any old profile row is deleted first since
    /// a builder has exactly one active profile embedding.
    async fn upsert_embedding(&self, record: &EmbeddingRecord) -> Result<()>;
    async fn delete_embeddings_by_content_hash(
        &self,
        content_hash: &str,
        content_type: ContentType,
    ) -> Result<u64>;
    async fn add_cast_tag(&self, cast_id: i64, tag: &str) -> Result<()>;
    /// Append-only with replace-by-(model, prompt_version, grant_id) key.
    async fn set_impact_verification(
        &self,
        cast_id: i64,
        verification: &ImpactVerification,
    ) -> Result<()>;
    async fn stamp_cast_story_ids(&self, cast_ids: &[i64], story_id: Uuid) -> Result<()>;
    /// Upsert matched by (grant_id, title, tagline). `story.edits` must
    /// contain only the NEW edit entries; they are appended to the stored
    /// log. `complete` never reverts true→false here.
    async fn upsert_story(&self, story: &StoryAnalysis) -> Result<Uuid>;
}

pub struct PgCastStore {
    pool: PgPool,
}

impl PgCastStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type CastTuple = (
    i64,
    String,
    i64,
    String,
    Option<String>,
    Option<String>,
    Vec<String>,
    Vec<String>,
    serde_json::Value,
    Vec<Uuid>,
    DateTime<Utc>,
);

fn row_to_cast(row: CastTuple) -> CastRow {
    let (id, hash, fid, text, parent_hash, parent_text, embeds, tags, verifications, story_ids, timestamp) =
        row;
    CastRow {
        id,
        hash,
        fid,
        text,
        parent_hash,
        parent_text,
        embeds,
        tags,
        impact_verifications: serde_json::from_value(verifications).unwrap_or_default(),
        story_ids,
        timestamp,
    }
}

const CAST_COLUMNS: &str = "c.id, c.hash, c.fid, c.text, c.parent_hash, p.text AS parent_text,
     c.embeds, c.tags, c.impact_verifications, c.story_ids, c.timestamp";

#[async_trait]
impl CastStore for PgCastStore {
    async fn get_cast_by_hash(&self, hash: &str) -> Result<Option<CastRow>> {
        let row: Option<CastTuple> = sqlx::query_as(&format!(
            "SELECT {CAST_COLUMNS} FROM casts c
             LEFT JOIN casts p ON p.hash = c.parent_hash
             WHERE c.hash = $1"
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_cast))
    }

    async fn get_casts_with_parent_for_fid(&self, fid: i64) -> Result<Vec<CastRow>> {
        let rows: Vec<CastTuple> = sqlx::query_as(&format!(
            "SELECT {CAST_COLUMNS} FROM casts c
             LEFT JOIN casts p ON p.hash = c.parent_hash
             WHERE c.fid = $1
             ORDER BY c.timestamp ASC"
        ))
        .bind(fid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_cast).collect())
    }

    async fn get_profile_by_fid(&self, fid: i64) -> Result<Option<Profile>> {
        let row: Option<(i64, Option<String>, Option<String>, Option<String>, Vec<String>)> =
            sqlx::query_as(
                "SELECT fid, fname, display_name, bio, verified_addresses
                 FROM profiles WHERE fid = $1",
            )
            .bind(fid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(fid, fname, display_name, bio, verified_addresses)| Profile {
            fid,
            fname,
            display_name,
            bio,
            verified_addresses,
        }))
    }

    async fn get_grants_for_recipients(&self, addresses: &[String]) -> Result<Vec<Grant>> {
        let rows: Vec<(String, String, String, String, Option<String>)> = sqlx::query_as(
            "SELECT id, title, description, recipient_address, parent_contract
             FROM grants
             WHERE lower(recipient_address) = ANY($1)",
        )
        .bind(
            addresses
                .iter()
                .map(|a| a.to_lowercase())
                .collect::<Vec<_>>(),
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, title, description, recipient_address, parent_contract)| Grant {
                id,
                title,
                description,
                recipient_address,
                parent_contract,
            })
            .collect())
    }

    async fn get_grant_and_parent(&self, grant_id: &str) -> Result<Option<(Grant, Option<Grant>)>> {
        let row: Option<(String, String, String, String, Option<String>)> = sqlx::query_as(
            "SELECT id, title, description, recipient_address, parent_contract
             FROM grants WHERE id = $1",
        )
        .bind(grant_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, title, description, recipient_address, parent_contract)) = row else {
            return Ok(None);
        };
        let grant = Grant {
            id,
            title,
            description,
            recipient_address,
            parent_contract: parent_contract.clone(),
        };

        let parent = match parent_contract {
            Some(contract) => {
                let parent_row: Option<(String, String, String, String, Option<String>)> =
                    sqlx::query_as(
                        "SELECT id, title, description, recipient_address, parent_contract
                         FROM grants WHERE id = $1",
                    )
                    .bind(&contract)
                    .fetch_optional(&self.pool)
                    .await?;
                parent_row.map(|(id, title, description, recipient_address, parent_contract)| {
                    Grant {
                        id,
                        title,
                        description,
                        recipient_address,
                        parent_contract,
                    }
                })
            }
            None => None,
        };

        Ok(Some((grant, parent)))
    }

    async fn get_stories_for_grant(&self, grant_id: &str) -> Result<Vec<StoryAnalysis>> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT to_jsonb(s) FROM stories s WHERE s.grant_id = $1 ORDER BY s.created_at",
        )
        .bind(grant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(v,)| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }

    async fn get_unassigned_casts_for_grant(&self, grant_id: &str) -> Result<Vec<CastRow>> {
        let rows: Vec<CastTuple> = sqlx::query_as(&format!(
            "SELECT {CAST_COLUMNS} FROM casts c
             LEFT JOIN casts p ON p.hash = c.parent_hash
             WHERE c.grant_id = $1 AND cardinality(c.story_ids) = 0
             ORDER BY c.timestamp ASC"
        ))
        .bind(grant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_cast).collect())
    }

    async fn get_token_metadata_for_url(&self, url: &str) -> Result<Option<TokenMetadata>> {
        let row: Option<(String, String, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT name, description, image_url, animation_url
             FROM token_metadata WHERE url = $1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(name, description, image_url, animation_url)| TokenMetadata {
            name,
            description,
            image_url,
            animation_url,
        }))
    }

    async fn upsert_embedding(&self, record: &EmbeddingRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if record.content_type == ContentType::BuilderProfile {
            sqlx::query(
                "DELETE FROM embeddings WHERE content_type = $1 AND external_id = $2",
            )
            .bind(record.content_type.as_str())
            .bind(&record.external_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO embeddings (
                 id, content_type, content, raw_content, content_hash, embedding,
                 groups, users, tags, external_id, external_url, urls,
                 url_summaries, version, created_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
             ON CONFLICT (content_hash) DO UPDATE SET
                 content = EXCLUDED.content,
                 raw_content = EXCLUDED.raw_content,
                 embedding = EXCLUDED.embedding,
                 groups = EXCLUDED.groups,
                 users = EXCLUDED.users,
                 tags = EXCLUDED.tags,
                 external_url = EXCLUDED.external_url,
                 urls = EXCLUDED.urls,
                 url_summaries = EXCLUDED.url_summaries,
                 version = EXCLUDED.version",
        )
        .bind(record.id)
        .bind(record.content_type.as_str())
        .bind(&record.content)
        .bind(&record.raw_content)
        .bind(&record.content_hash)
        .bind(&record.embedding)
        .bind(&record.groups)
        .bind(&record.users)
        .bind(&record.tags)
        .bind(&record.external_id)
        .bind(&record.external_url)
        .bind(&record.urls)
        .bind(&record.url_summaries)
        .bind(record.version)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_embeddings_by_content_hash(
        &self,
        content_hash: &str,
        content_type: ContentType,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM embeddings WHERE content_hash = $1 AND content_type = $2",
        )
        .bind(content_hash)
        .bind(content_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn add_cast_tag(&self, cast_id: i64, tag: &str) -> Result<()> {
        // Single-expression append; no read-modify-write round trip.
        sqlx::query(
            "UPDATE casts SET tags = array_append(tags, $2)
             WHERE id = $1 AND NOT ($2 = ANY(tags))",
        )
        .bind(cast_id)
        .bind(tag)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_impact_verification(
        &self,
        cast_id: i64,
        verification: &ImpactVerification,
    ) -> Result<()> {
        // Drop any prior entry with the same (model, prompt_version,
        // grant_id) key, then append, all in one statement.
        sqlx::query(
            "UPDATE casts SET impact_verifications = (
                 SELECT coalesce(jsonb_agg(v), '[]'::jsonb)
                 FROM jsonb_array_elements(impact_verifications) v
                 WHERE NOT (v->>'model' = $2
                        AND v->>'prompt_version' = $3
                        AND v->>'grant_id' = $4)
             ) || jsonb_build_array($5::jsonb)
             WHERE id = $1",
        )
        .bind(cast_id)
        .bind(&verification.model)
        .bind(&verification.prompt_version)
        .bind(&verification.grant_id)
        .bind(serde_json::to_value(verification)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stamp_cast_story_ids(&self, cast_ids: &[i64], story_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE casts SET story_ids = array_append(story_ids, $2)
             WHERE id = ANY($1) AND NOT ($2 = ANY(story_ids))",
        )
        .bind(cast_ids)
        .bind(story_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_story(&self, story: &StoryAnalysis) -> Result<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO stories (
                 id, grant_id, title, tagline, summary, key_points, participants,
                 timeline, sentiment, completeness, complete, sources, media_urls,
                 header_image, cast_hashes, edits, info_needed_to_complete,
                 mint_urls, author, created_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                       $14, $15, $16, $17, $18, $19, $20)
             ON CONFLICT (grant_id, title, tagline) DO UPDATE SET
                 summary = EXCLUDED.summary,
                 key_points = EXCLUDED.key_points,
                 participants = EXCLUDED.participants,
                 timeline = EXCLUDED.timeline,
                 sentiment = EXCLUDED.sentiment,
                 completeness = EXCLUDED.completeness,
                 complete = stories.complete OR EXCLUDED.complete,
                 sources = EXCLUDED.sources,
                 media_urls = EXCLUDED.media_urls,
                 header_image = EXCLUDED.header_image,
                 cast_hashes = EXCLUDED.cast_hashes,
                 edits = stories.edits || EXCLUDED.edits,
                 info_needed_to_complete = EXCLUDED.info_needed_to_complete,
                 mint_urls = EXCLUDED.mint_urls
             RETURNING id",
        )
        .bind(story.id)
        .bind(&story.grant_id)
        .bind(&story.title)
        .bind(&story.tagline)
        .bind(&story.summary)
        .bind(&story.key_points)
        .bind(&story.participants)
        .bind(&story.timeline)
        .bind(serde_json::to_value(story.sentiment)?.as_str().unwrap_or("neutral").to_string())
        .bind(story.completeness)
        .bind(story.complete)
        .bind(&story.sources)
        .bind(&story.media_urls)
        .bind(&story.header_image)
        .bind(&story.cast_hashes)
        .bind(serde_json::to_value(&story.edits)?)
        .bind(&story.info_needed_to_complete)
        .bind(&story.mint_urls)
        .bind(&story.author)
        .bind(story.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}
