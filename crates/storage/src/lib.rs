pub mod images;

pub use images::{ImageStore, IMAGE_ID_LEN};

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use std::convert::TryFrom;
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::sync::Mutex;

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");

/// Sentinel version of a hosted identity whose profile was never initialized.
pub const UNINITIALIZED_VERSION: [u8; 3] = [0, 0, 0];
/// How long a cancelled identity with a redirect stays queryable.
pub const CANCEL_REDIRECT_RETENTION_DAYS: i64 = 14;
/// Deadline a follower gets to complete its initialization stream.
pub const INITIALIZATION_BLOCK_MINUTES: i64 = 20;
/// Upper bound on items applied per inbound replication transaction.
pub const NEIGHBOR_APPLY_BATCH_LEN: usize = 100;

#[derive(Debug)]
pub enum StorageError {
    Database,
    Serialization,
    Missing,
    Invalid,
    Io(std::io::Error),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database => write!(f, "database failure"),
            Self::Serialization => write!(f, "serialization failure"),
            Self::Missing => write!(f, "missing record"),
            Self::Invalid => write!(f, "invalid state"),
            Self::Io(err) => write!(f, "blob io failure: {}", err),
        }
    }
}

impl Error for StorageError {}

#[derive(Debug, Clone, PartialEq)]
pub struct HostedIdentity {
    pub identity_id: [u8; 32],
    pub public_key: Vec<u8>,
    pub version: [u8; 3],
    pub name: String,
    pub identity_type: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub extra_data: String,
    pub profile_image_id: Option<[u8; IMAGE_ID_LEN]>,
    pub thumbnail_image_id: Option<[u8; IMAGE_ID_LEN]>,
    pub hosting_redirect_id: Option<Vec<u8>>,
    pub expiration_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HostedIdentity {
    /// A profile is initialized once its first `UpdateProfile` has been
    /// applied and the version left the invalid sentinel.
    pub fn is_initialized(&self) -> bool {
        self.version != UNINITIALIZED_VERSION
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NeighborIdentity {
    pub identity_id: [u8; 32],
    pub neighbor_id: [u8; 32],
    pub public_key: Vec<u8>,
    pub version: [u8; 3],
    pub name: String,
    pub identity_type: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub extra_data: String,
    pub thumbnail_image_id: Option<[u8; IMAGE_ID_LEN]>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelatedIdentityCard {
    pub identity_id: [u8; 32],
    pub application_id: Vec<u8>,
    pub card_id: Vec<u8>,
    pub card_version: Vec<u8>,
    pub issuer_public_key: Vec<u8>,
    pub recipient_public_key: Vec<u8>,
    pub card_type: String,
    pub valid_from: i64,
    pub valid_to: i64,
    pub issuer_signature: Vec<u8>,
    pub recipient_signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Follower {
    pub follower_id: [u8; 32],
    pub ip: String,
    pub primary_port: u16,
    pub neighbor_port: u16,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub neighbor_id: [u8; 32],
    pub last_refresh_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    AddProfile = 0,
    ChangeProfile = 1,
    RemoveProfile = 2,
    InitializationInProgress = 3,
}

impl ActionType {
    fn from_i64(value: i64) -> Result<Self, StorageError> {
        match value {
            0 => Ok(Self::AddProfile),
            1 => Ok(Self::ChangeProfile),
            2 => Ok(Self::RemoveProfile),
            3 => Ok(Self::InitializationInProgress),
            _ => Err(StorageError::Serialization),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NeighborhoodAction {
    pub action_id: i64,
    pub server_id: [u8; 32],
    pub action_type: ActionType,
    pub target_identity_id: Option<[u8; 32]>,
    pub extra: Option<String>,
    pub created_at: DateTime<Utc>,
    pub execute_after: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    Reactivated,
    AlreadyActive,
    QuotaExceeded,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CardOutcome {
    Added,
    Duplicate,
    QuotaExceeded,
}

#[derive(Debug)]
pub enum FollowerAdmission {
    Accepted(Vec<HostedIdentity>),
    TooManyFollowers,
    TooManyInitializations,
}

/// Tri-state field updates for a hosted profile. `None` leaves the field
/// untouched; the image fields distinguish "replace" from "clear".
#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub version: Option<[u8; 3]>,
    pub name: Option<String>,
    pub location: Option<(f64, f64)>,
    pub extra_data: Option<String>,
    pub profile_image: Option<Option<[u8; IMAGE_ID_LEN]>>,
    pub thumbnail_image: Option<Option<[u8; IMAGE_ID_LEN]>>,
}

#[derive(Debug)]
pub struct ProfileCommit {
    pub first_initialization: bool,
    /// Image ids replaced by this update; unlinked only after commit.
    pub removed_images: Vec<[u8; IMAGE_ID_LEN]>,
}

#[derive(Debug, Clone)]
pub enum NeighborApplyItem {
    Add(NeighborIdentity),
    Change(NeighborIdentityChange),
    Delete { identity_id: [u8; 32] },
}

#[derive(Debug, Clone, Default)]
pub struct NeighborIdentityChange {
    pub identity_id: [u8; 32],
    pub version: Option<[u8; 3]>,
    pub name: Option<String>,
    pub location: Option<(f64, f64)>,
    pub extra_data: Option<String>,
    pub thumbnail_image: Option<Option<[u8; IMAGE_ID_LEN]>>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct NeighborApplyFailure {
    pub index: usize,
    pub field: &'static str,
}

#[derive(Debug, Default)]
pub struct NeighborBatchOutcome {
    pub applied: usize,
    pub kept_images: Vec<[u8; IMAGE_ID_LEN]>,
    pub removed_images: Vec<[u8; IMAGE_ID_LEN]>,
    pub failure: Option<NeighborApplyFailure>,
}

#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

#[derive(Debug, Clone)]
pub struct SearchFilter {
    pub name_like: String,
    pub type_like: String,
    pub bbox: Option<BoundingBox>,
}

/// Converts a `*`/`?` wildcard pattern into a SQL LIKE pattern with
/// backslash escaping. An empty pattern matches everything.
pub fn wildcard_to_like(pattern: &str) -> String {
    if pattern.is_empty() {
        return "%".to_string();
    }
    let mut like = String::with_capacity(pattern.len() + 4);
    for ch in pattern.chars() {
        match ch {
            '*' => like.push('%'),
            '?' => like.push('_'),
            '%' | '_' | '\\' => {
                like.push('\\');
                like.push(ch);
            }
            other => like.push(other),
        }
    }
    like
}

fn encode_time(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn decode_time(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| StorageError::Serialization)
}

fn decode_time_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>, StorageError> {
    value.as_deref().map(decode_time).transpose()
}

fn id32(value: Vec<u8>) -> Result<[u8; 32], StorageError> {
    <[u8; 32]>::try_from(value.as_slice()).map_err(|_| StorageError::Serialization)
}

fn id32_opt(value: Option<Vec<u8>>) -> Result<Option<[u8; 32]>, StorageError> {
    value.map(id32).transpose()
}

fn id16_opt(value: Option<Vec<u8>>) -> Result<Option<[u8; IMAGE_ID_LEN]>, StorageError> {
    value
        .map(|raw| <[u8; IMAGE_ID_LEN]>::try_from(raw.as_slice()))
        .transpose()
        .map_err(|_| StorageError::Serialization)
}

fn version3(value: Vec<u8>) -> Result<[u8; 3], StorageError> {
    <[u8; 3]>::try_from(value.as_slice()).map_err(|_| StorageError::Serialization)
}

struct HostedRow {
    identity_id: Vec<u8>,
    public_key: Vec<u8>,
    version: Vec<u8>,
    name: String,
    identity_type: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    extra_data: String,
    profile_image_id: Option<Vec<u8>>,
    thumbnail_image_id: Option<Vec<u8>>,
    hosting_redirect_id: Option<Vec<u8>>,
    expiration_at: Option<String>,
    created_at: String,
    updated_at: String,
}

const HOSTED_COLUMNS: &str = "identity_id, public_key, version, name, identity_type, latitude, \
     longitude, extra_data, profile_image_id, thumbnail_image_id, hosting_redirect_id, \
     expiration_at, created_at, updated_at";

fn read_hosted_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HostedRow> {
    Ok(HostedRow {
        identity_id: row.get(0)?,
        public_key: row.get(1)?,
        version: row.get(2)?,
        name: row.get(3)?,
        identity_type: row.get(4)?,
        latitude: row.get(5)?,
        longitude: row.get(6)?,
        extra_data: row.get(7)?,
        profile_image_id: row.get(8)?,
        thumbnail_image_id: row.get(9)?,
        hosting_redirect_id: row.get(10)?,
        expiration_at: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl TryFrom<HostedRow> for HostedIdentity {
    type Error = StorageError;

    fn try_from(row: HostedRow) -> Result<Self, StorageError> {
        Ok(HostedIdentity {
            identity_id: id32(row.identity_id)?,
            public_key: row.public_key,
            version: version3(row.version)?,
            name: row.name,
            identity_type: row.identity_type,
            latitude: row.latitude,
            longitude: row.longitude,
            extra_data: row.extra_data,
            profile_image_id: id16_opt(row.profile_image_id)?,
            thumbnail_image_id: id16_opt(row.thumbnail_image_id)?,
            hosting_redirect_id: row.hosting_redirect_id,
            expiration_at: decode_time_opt(row.expiration_at)?,
            created_at: decode_time(&row.created_at)?,
            updated_at: decode_time(&row.updated_at)?,
        })
    }
}

struct NeighborIdentityRow {
    identity_id: Vec<u8>,
    neighbor_id: Vec<u8>,
    public_key: Vec<u8>,
    version: Vec<u8>,
    name: String,
    identity_type: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    extra_data: String,
    thumbnail_image_id: Option<Vec<u8>>,
    updated_at: String,
}

const NEIGHBOR_IDENTITY_COLUMNS: &str = "identity_id, neighbor_id, public_key, version, name, \
     identity_type, latitude, longitude, extra_data, thumbnail_image_id, updated_at";

fn read_neighbor_identity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NeighborIdentityRow> {
    Ok(NeighborIdentityRow {
        identity_id: row.get(0)?,
        neighbor_id: row.get(1)?,
        public_key: row.get(2)?,
        version: row.get(3)?,
        name: row.get(4)?,
        identity_type: row.get(5)?,
        latitude: row.get(6)?,
        longitude: row.get(7)?,
        extra_data: row.get(8)?,
        thumbnail_image_id: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl TryFrom<NeighborIdentityRow> for NeighborIdentity {
    type Error = StorageError;

    fn try_from(row: NeighborIdentityRow) -> Result<Self, StorageError> {
        Ok(NeighborIdentity {
            identity_id: id32(row.identity_id)?,
            neighbor_id: id32(row.neighbor_id)?,
            public_key: row.public_key,
            version: version3(row.version)?,
            name: row.name,
            identity_type: row.identity_type,
            latitude: row.latitude,
            longitude: row.longitude,
            extra_data: row.extra_data,
            thumbnail_image_id: id16_opt(row.thumbnail_image_id)?,
            updated_at: decode_time(&row.updated_at)?,
        })
    }
}

fn read_action_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, Vec<u8>, i64, Option<Vec<u8>>, Option<String>, String, Option<String>, i64, Option<String>)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn action_from_raw(
    raw: (i64, Vec<u8>, i64, Option<Vec<u8>>, Option<String>, String, Option<String>, i64, Option<String>),
) -> Result<NeighborhoodAction, StorageError> {
    Ok(NeighborhoodAction {
        action_id: raw.0,
        server_id: id32(raw.1)?,
        action_type: ActionType::from_i64(raw.2)?,
        target_identity_id: id32_opt(raw.3)?,
        extra: raw.4,
        created_at: decode_time(&raw.5)?,
        execute_after: decode_time_opt(raw.6)?,
        attempts: raw.7,
        last_error: raw.8,
    })
}

const ACTION_COLUMNS: &str = "action_id, server_id, action_type, target_identity_id, extra, \
     created_at, execute_after, attempts, last_error";

pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Opens the database; `:memory:` is accepted for tests.
    pub async fn connect(database: &str) -> Result<Storage, StorageError> {
        let conn = Connection::open(database).map_err(|_| StorageError::Database)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(Storage {
            conn: Mutex::new(conn),
        })
    }

    /// Applies the schema; idempotent.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute_batch(INIT_SQL)
            .map_err(|_| StorageError::Database)
    }

    // Hosted identities.

    /// Creates or reactivates a hosted identity under a hosting contract.
    /// The quota is counted inside the same transaction that inserts.
    pub async fn register_hosting(
        &self,
        identity_id: &[u8; 32],
        public_key: &[u8],
        now: DateTime<Utc>,
        max_hosted: u32,
    ) -> Result<RegisterOutcome, StorageError> {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction().map_err(|_| StorageError::Database)?;
        let active: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM hosted_identity WHERE expiration_at IS NULL",
                [],
                |row| row.get(0),
            )
            .map_err(|_| StorageError::Database)?;
        let existing: Option<Option<String>> = tx
            .query_row(
                "SELECT expiration_at FROM hosted_identity WHERE identity_id = ?",
                params![identity_id.as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|_| StorageError::Database)?;
        let outcome = match existing {
            Some(None) => RegisterOutcome::AlreadyActive,
            Some(Some(_)) => {
                if active >= max_hosted as i64 {
                    RegisterOutcome::QuotaExceeded
                } else {
                    tx.execute(
                        "UPDATE hosted_identity SET expiration_at = NULL, \
                         hosting_redirect_id = NULL, updated_at = ? WHERE identity_id = ?",
                        params![encode_time(&now), identity_id.as_slice()],
                    )
                    .map_err(|_| StorageError::Database)?;
                    RegisterOutcome::Reactivated
                }
            }
            None => {
                if active >= max_hosted as i64 {
                    RegisterOutcome::QuotaExceeded
                } else {
                    tx.execute(
                        "INSERT INTO hosted_identity (identity_id, public_key, version, \
                         created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
                        params![
                            identity_id.as_slice(),
                            public_key,
                            UNINITIALIZED_VERSION.as_slice(),
                            encode_time(&now),
                            encode_time(&now)
                        ],
                    )
                    .map_err(|_| StorageError::Database)?;
                    RegisterOutcome::Created
                }
            }
        };
        tx.commit().map_err(|_| StorageError::Database)?;
        Ok(outcome)
    }

    pub async fn load_hosted(
        &self,
        identity_id: &[u8; 32],
    ) -> Result<Option<HostedIdentity>, StorageError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {HOSTED_COLUMNS} FROM hosted_identity WHERE identity_id = ?"
                ),
                params![identity_id.as_slice()],
                read_hosted_row,
            )
            .optional()
            .map_err(|_| StorageError::Database)?;
        row.map(HostedIdentity::try_from).transpose()
    }

    /// Applies a partial profile update and fans the change out as one
    /// neighborhood action per follower, all in one transaction.
    pub async fn update_profile(
        &self,
        identity_id: &[u8; 32],
        changes: &ProfileChanges,
        now: DateTime<Utc>,
    ) -> Result<ProfileCommit, StorageError> {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction().map_err(|_| StorageError::Database)?;
        let row = tx
            .query_row(
                &format!(
                    "SELECT {HOSTED_COLUMNS} FROM hosted_identity WHERE identity_id = ?"
                ),
                params![identity_id.as_slice()],
                read_hosted_row,
            )
            .optional()
            .map_err(|_| StorageError::Database)?
            .ok_or(StorageError::Missing)?;
        let mut identity = HostedIdentity::try_from(row)?;
        let was_initialized = identity.is_initialized();
        if !was_initialized
            && (changes.version.is_none()
                || changes.name.is_none()
                || changes.location.is_none())
        {
            return Err(StorageError::Invalid);
        }
        let mut removed_images = Vec::new();
        if let Some(version) = changes.version {
            identity.version = version;
        }
        if let Some(name) = &changes.name {
            identity.name = name.clone();
        }
        if let Some((latitude, longitude)) = changes.location {
            identity.latitude = Some(latitude);
            identity.longitude = Some(longitude);
        }
        if let Some(extra) = &changes.extra_data {
            identity.extra_data = extra.clone();
        }
        if let Some(new_image) = changes.profile_image {
            if let Some(old) = identity.profile_image_id {
                removed_images.push(old);
            }
            identity.profile_image_id = new_image;
        }
        if let Some(new_image) = changes.thumbnail_image {
            if let Some(old) = identity.thumbnail_image_id {
                removed_images.push(old);
            }
            identity.thumbnail_image_id = new_image;
        }
        tx.execute(
            "UPDATE hosted_identity SET version = ?, name = ?, identity_type = ?, \
             latitude = ?, longitude = ?, extra_data = ?, profile_image_id = ?, \
             thumbnail_image_id = ?, updated_at = ? WHERE identity_id = ?",
            params![
                identity.version.as_slice(),
                identity.name,
                identity.identity_type,
                identity.latitude,
                identity.longitude,
                identity.extra_data,
                identity.profile_image_id.map(|id| id.to_vec()),
                identity.thumbnail_image_id.map(|id| id.to_vec()),
                encode_time(&now),
                identity_id.as_slice()
            ],
        )
        .map_err(|_| StorageError::Database)?;
        let action_type = if was_initialized {
            ActionType::ChangeProfile
        } else {
            ActionType::AddProfile
        };
        insert_follower_actions(&tx, action_type, identity_id, &now)?;
        tx.commit().map_err(|_| StorageError::Database)?;
        Ok(ProfileCommit {
            first_initialization: !was_initialized,
            removed_images,
        })
    }

    /// Cancels the hosting agreement; with a redirect the profile stays
    /// queryable for the retention window.
    pub async fn cancel_hosting(
        &self,
        identity_id: &[u8; 32],
        redirect: Option<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction().map_err(|_| StorageError::Database)?;
        let version: Option<Vec<u8>> = tx
            .query_row(
                "SELECT version FROM hosted_identity WHERE identity_id = ?",
                params![identity_id.as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|_| StorageError::Database)?;
        let version = version.ok_or(StorageError::Missing)?;
        let expiration = if redirect.is_some() {
            now + Duration::days(CANCEL_REDIRECT_RETENTION_DAYS)
        } else {
            now
        };
        // A never-initialized profile gets a structural version so redirected
        // lookups still return something well-formed.
        let effective_version = if version.as_slice() == UNINITIALIZED_VERSION.as_slice() {
            vec![1, 0, 0]
        } else {
            version
        };
        tx.execute(
            "UPDATE hosted_identity SET expiration_at = ?, hosting_redirect_id = ?, \
             version = ?, updated_at = ? WHERE identity_id = ?",
            params![
                encode_time(&expiration),
                redirect,
                effective_version,
                encode_time(&now),
                identity_id.as_slice()
            ],
        )
        .map_err(|_| StorageError::Database)?;
        insert_follower_actions(&tx, ActionType::RemoveProfile, identity_id, &now)?;
        tx.commit().map_err(|_| StorageError::Database)?;
        Ok(())
    }

    /// Pages initialized hosted identities matching the SQL-level filters.
    pub async fn search_hosted(
        &self,
        filter: &SearchFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<HostedIdentity>, StorageError> {
        let conn = self.conn.lock().await;
        let (sql, values) = search_query("hosted_identity", HOSTED_COLUMNS, filter, offset, limit);
        let mut stmt = conn.prepare(&sql).map_err(|_| StorageError::Database)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), read_hosted_row)
            .map_err(|_| StorageError::Database)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| StorageError::Database)?;
        rows.into_iter().map(HostedIdentity::try_from).collect()
    }

    /// Removes hosted identities whose expiration has passed; returns the
    /// image ids their rows referenced so the caller can unlink them.
    pub async fn delete_expired_hosted(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<[u8; IMAGE_ID_LEN]>, StorageError> {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction().map_err(|_| StorageError::Database)?;
        let mut images = Vec::new();
        {
            let mut stmt = tx
                .prepare(
                    "SELECT profile_image_id, thumbnail_image_id FROM hosted_identity \
                     WHERE expiration_at IS NOT NULL AND expiration_at <= ?",
                )
                .map_err(|_| StorageError::Database)?;
            let rows = stmt
                .query_map(params![encode_time(&now)], |row| {
                    Ok((
                        row.get::<_, Option<Vec<u8>>>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                    ))
                })
                .map_err(|_| StorageError::Database)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| StorageError::Database)?;
            for (profile, thumbnail) in rows {
                if let Some(id) = id16_opt(profile)? {
                    images.push(id);
                }
                if let Some(id) = id16_opt(thumbnail)? {
                    images.push(id);
                }
            }
        }
        tx.execute(
            "DELETE FROM hosted_identity WHERE expiration_at IS NOT NULL AND expiration_at <= ?",
            params![encode_time(&now)],
        )
        .map_err(|_| StorageError::Database)?;
        tx.commit().map_err(|_| StorageError::Database)?;
        Ok(images)
    }

    pub async fn count_hosted(&self) -> Result<u64, StorageError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM hosted_identity", [], |row| row.get(0))
            .map_err(|_| StorageError::Database)?;
        Ok(count as u64)
    }

    // Relationship cards.

    /// Stores a validated relationship card; the per-identity application
    /// cap is enforced inside the inserting transaction.
    pub async fn add_related_card(
        &self,
        card: &RelatedIdentityCard,
        max_relations: u32,
    ) -> Result<CardOutcome, StorageError> {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction().map_err(|_| StorageError::Database)?;
        let duplicate: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM related_identity WHERE identity_id = ? AND application_id = ?",
                params![card.identity_id.as_slice(), card.application_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|_| StorageError::Database)?;
        if duplicate.is_some() {
            return Ok(CardOutcome::Duplicate);
        }
        let count: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM related_identity WHERE identity_id = ?",
                params![card.identity_id.as_slice()],
                |row| row.get(0),
            )
            .map_err(|_| StorageError::Database)?;
        if count >= max_relations as i64 {
            return Ok(CardOutcome::QuotaExceeded);
        }
        tx.execute(
            "INSERT INTO related_identity (identity_id, application_id, card_id, card_version, \
             issuer_public_key, recipient_public_key, card_type, valid_from, valid_to, \
             issuer_signature, recipient_signature) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                card.identity_id.as_slice(),
                card.application_id,
                card.card_id,
                card.card_version,
                card.issuer_public_key,
                card.recipient_public_key,
                card.card_type,
                card.valid_from,
                card.valid_to,
                card.issuer_signature,
                card.recipient_signature
            ],
        )
        .map_err(|_| StorageError::Database)?;
        tx.commit().map_err(|_| StorageError::Database)?;
        Ok(CardOutcome::Added)
    }

    pub async fn remove_related_card(
        &self,
        identity_id: &[u8; 32],
        application_id: &[u8],
    ) -> Result<bool, StorageError> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "DELETE FROM related_identity WHERE identity_id = ? AND application_id = ?",
                params![identity_id.as_slice(), application_id],
            )
            .map_err(|_| StorageError::Database)?;
        Ok(affected > 0)
    }

    pub async fn list_related_cards(
        &self,
        identity_id: &[u8; 32],
        include_invalid: bool,
        card_type_like: Option<&str>,
        issuer_public_key: Option<&[u8]>,
        now_ms: i64,
    ) -> Result<Vec<RelatedIdentityCard>, StorageError> {
        let conn = self.conn.lock().await;
        let mut sql = String::from(
            "SELECT identity_id, application_id, card_id, card_version, issuer_public_key, \
             recipient_public_key, card_type, valid_from, valid_to, issuer_signature, \
             recipient_signature FROM related_identity WHERE identity_id = ?",
        );
        let mut values: Vec<Value> = vec![Value::Blob(identity_id.to_vec())];
        if let Some(pattern) = card_type_like {
            sql.push_str(" AND card_type LIKE ? ESCAPE '\\'");
            values.push(Value::Text(pattern.to_string()));
        }
        if let Some(issuer) = issuer_public_key {
            sql.push_str(" AND issuer_public_key = ?");
            values.push(Value::Blob(issuer.to_vec()));
        }
        if !include_invalid {
            sql.push_str(" AND valid_from <= ? AND valid_to >= ?");
            values.push(Value::Integer(now_ms));
            values.push(Value::Integer(now_ms));
        }
        sql.push_str(" ORDER BY rowid");
        let mut stmt = conn.prepare(&sql).map_err(|_| StorageError::Database)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, Vec<u8>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, Vec<u8>>(9)?,
                    row.get::<_, Vec<u8>>(10)?,
                ))
            })
            .map_err(|_| StorageError::Database)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| StorageError::Database)?;
        rows.into_iter()
            .map(|raw| {
                Ok(RelatedIdentityCard {
                    identity_id: id32(raw.0)?,
                    application_id: raw.1,
                    card_id: raw.2,
                    card_version: raw.3,
                    issuer_public_key: raw.4,
                    recipient_public_key: raw.5,
                    card_type: raw.6,
                    valid_from: raw.7,
                    valid_to: raw.8,
                    issuer_signature: raw.9,
                    recipient_signature: raw.10,
                })
            })
            .collect()
    }

    // Neighbors (identities replicated to us).

    pub async fn upsert_neighbor(
        &self,
        neighbor_id: &[u8; 32],
        last_refresh_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO neighbor (neighbor_id, last_refresh_at) VALUES (?, ?) \
             ON CONFLICT (neighbor_id) DO UPDATE SET last_refresh_at = excluded.last_refresh_at",
            params![
                neighbor_id.as_slice(),
                last_refresh_at.map(|at| encode_time(&at))
            ],
        )
        .map_err(|_| StorageError::Database)?;
        Ok(())
    }

    pub async fn load_neighbor(
        &self,
        neighbor_id: &[u8; 32],
    ) -> Result<Option<Neighbor>, StorageError> {
        let conn = self.conn.lock().await;
        let row: Option<Option<String>> = conn
            .query_row(
                "SELECT last_refresh_at FROM neighbor WHERE neighbor_id = ?",
                params![neighbor_id.as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|_| StorageError::Database)?;
        match row {
            None => Ok(None),
            Some(last_refresh_at) => Ok(Some(Neighbor {
                neighbor_id: *neighbor_id,
                last_refresh_at: decode_time_opt(last_refresh_at)?,
            })),
        }
    }

    pub async fn bump_neighbor_refresh(
        &self,
        neighbor_id: &[u8; 32],
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE neighbor SET last_refresh_at = ? WHERE neighbor_id = ?",
                params![encode_time(&now), neighbor_id.as_slice()],
            )
            .map_err(|_| StorageError::Database)?;
        if affected == 0 {
            return Err(StorageError::Missing);
        }
        Ok(())
    }

    /// Removes a neighbor and everything replicated from it; returns image
    /// ids to unlink.
    pub async fn remove_neighbor(
        &self,
        neighbor_id: &[u8; 32],
    ) -> Result<Vec<[u8; IMAGE_ID_LEN]>, StorageError> {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction().map_err(|_| StorageError::Database)?;
        let images = neighbor_identity_images(&tx, neighbor_id)?;
        tx.execute(
            "DELETE FROM neighbor_identity WHERE neighbor_id = ?",
            params![neighbor_id.as_slice()],
        )
        .map_err(|_| StorageError::Database)?;
        tx.execute(
            "DELETE FROM neighbor WHERE neighbor_id = ?",
            params![neighbor_id.as_slice()],
        )
        .map_err(|_| StorageError::Database)?;
        tx.commit().map_err(|_| StorageError::Database)?;
        Ok(images)
    }

    pub async fn list_neighbor_ids(&self) -> Result<Vec<[u8; 32]>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT neighbor_id FROM neighbor ORDER BY rowid")
            .map_err(|_| StorageError::Database)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))
            .map_err(|_| StorageError::Database)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| StorageError::Database)?;
        rows.into_iter().map(id32).collect()
    }

    /// Drops neighbors not refreshed since the cutoff, along with their
    /// replicated identities; returns image ids to unlink.
    pub async fn expire_stale_neighbors(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<[u8; IMAGE_ID_LEN]>, StorageError> {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction().map_err(|_| StorageError::Database)?;
        let stale: Vec<Vec<u8>> = {
            let mut stmt = tx
                .prepare(
                    "SELECT neighbor_id FROM neighbor \
                     WHERE last_refresh_at IS NOT NULL AND last_refresh_at < ?",
                )
                .map_err(|_| StorageError::Database)?;
            let rows = stmt
                .query_map(params![encode_time(&cutoff)], |row| row.get(0))
                .map_err(|_| StorageError::Database)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| StorageError::Database)?;
            rows
        };
        let mut images = Vec::new();
        for raw in &stale {
            let neighbor_id = id32(raw.clone())?;
            images.extend(neighbor_identity_images(&tx, &neighbor_id)?);
            tx.execute(
                "DELETE FROM neighbor_identity WHERE neighbor_id = ?",
                params![raw],
            )
            .map_err(|_| StorageError::Database)?;
            tx.execute("DELETE FROM neighbor WHERE neighbor_id = ?", params![raw])
                .map_err(|_| StorageError::Database)?;
        }
        tx.commit().map_err(|_| StorageError::Database)?;
        Ok(images)
    }

    pub async fn search_neighbor(
        &self,
        filter: &SearchFilter,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<NeighborIdentity>, StorageError> {
        let conn = self.conn.lock().await;
        let (sql, values) = search_query(
            "neighbor_identity",
            NEIGHBOR_IDENTITY_COLUMNS,
            filter,
            offset,
            limit,
        );
        let mut stmt = conn.prepare(&sql).map_err(|_| StorageError::Database)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), read_neighbor_identity_row)
            .map_err(|_| StorageError::Database)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| StorageError::Database)?;
        rows.into_iter().map(NeighborIdentity::try_from).collect()
    }

    pub async fn load_neighbor_identity(
        &self,
        identity_id: &[u8; 32],
        neighbor_id: &[u8; 32],
    ) -> Result<Option<NeighborIdentity>, StorageError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {NEIGHBOR_IDENTITY_COLUMNS} FROM neighbor_identity \
                     WHERE identity_id = ? AND neighbor_id = ?"
                ),
                params![identity_id.as_slice(), neighbor_id.as_slice()],
                read_neighbor_identity_row,
            )
            .optional()
            .map_err(|_| StorageError::Database)?;
        row.map(NeighborIdentity::try_from).transpose()
    }

    pub async fn count_neighbor_identities(
        &self,
        neighbor_id: &[u8; 32],
    ) -> Result<u64, StorageError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM neighbor_identity WHERE neighbor_id = ?",
                params![neighbor_id.as_slice()],
                |row| row.get(0),
            )
            .map_err(|_| StorageError::Database)?;
        Ok(count as u64)
    }

    /// Applies one inbound replication batch in a single transaction. The
    /// first failing item stops the batch; items before it are committed.
    pub async fn apply_neighbor_batch(
        &self,
        neighbor_id: &[u8; 32],
        items: &[NeighborApplyItem],
        now: DateTime<Utc>,
    ) -> Result<NeighborBatchOutcome, StorageError> {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction().map_err(|_| StorageError::Database)?;
        let mut outcome = NeighborBatchOutcome::default();
        for (index, item) in items.iter().enumerate() {
            match item {
                NeighborApplyItem::Add(identity) => {
                    let exists: Option<i64> = tx
                        .query_row(
                            "SELECT 1 FROM neighbor_identity \
                             WHERE identity_id = ? AND neighbor_id = ?",
                            params![identity.identity_id.as_slice(), neighbor_id.as_slice()],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(|_| StorageError::Database)?;
                    if exists.is_some() {
                        outcome.failure = Some(NeighborApplyFailure {
                            index,
                            field: "add.identityPublicKey",
                        });
                        break;
                    }
                    tx.execute(
                        "INSERT INTO neighbor_identity (identity_id, neighbor_id, public_key, \
                         version, name, identity_type, latitude, longitude, extra_data, \
                         thumbnail_image_id, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                        params![
                            identity.identity_id.as_slice(),
                            neighbor_id.as_slice(),
                            identity.public_key,
                            identity.version.as_slice(),
                            identity.name,
                            identity.identity_type,
                            identity.latitude,
                            identity.longitude,
                            identity.extra_data,
                            identity.thumbnail_image_id.map(|id| id.to_vec()),
                            encode_time(&now)
                        ],
                    )
                    .map_err(|_| StorageError::Database)?;
                    if let Some(image) = identity.thumbnail_image_id {
                        outcome.kept_images.push(image);
                    }
                }
                NeighborApplyItem::Change(change) => {
                    let row = tx
                        .query_row(
                            &format!(
                                "SELECT {NEIGHBOR_IDENTITY_COLUMNS} FROM neighbor_identity \
                                 WHERE identity_id = ? AND neighbor_id = ?"
                            ),
                            params![change.identity_id.as_slice(), neighbor_id.as_slice()],
                            read_neighbor_identity_row,
                        )
                        .optional()
                        .map_err(|_| StorageError::Database)?;
                    let Some(row) = row else {
                        outcome.failure = Some(NeighborApplyFailure {
                            index,
                            field: "change.identityNetworkId",
                        });
                        break;
                    };
                    let mut identity = NeighborIdentity::try_from(row)?;
                    if let Some(version) = change.version {
                        identity.version = version;
                    }
                    if let Some(name) = &change.name {
                        identity.name = name.clone();
                    }
                    if let Some((latitude, longitude)) = change.location {
                        identity.latitude = Some(latitude);
                        identity.longitude = Some(longitude);
                    }
                    if let Some(extra) = &change.extra_data {
                        identity.extra_data = extra.clone();
                    }
                    if let Some(new_image) = change.thumbnail_image {
                        if let Some(old) = identity.thumbnail_image_id {
                            outcome.removed_images.push(old);
                        }
                        identity.thumbnail_image_id = new_image;
                        if let Some(image) = new_image {
                            outcome.kept_images.push(image);
                        }
                    }
                    tx.execute(
                        "UPDATE neighbor_identity SET version = ?, name = ?, latitude = ?, \
                         longitude = ?, extra_data = ?, thumbnail_image_id = ?, updated_at = ? \
                         WHERE identity_id = ? AND neighbor_id = ?",
                        params![
                            identity.version.as_slice(),
                            identity.name,
                            identity.latitude,
                            identity.longitude,
                            identity.extra_data,
                            identity.thumbnail_image_id.map(|id| id.to_vec()),
                            encode_time(&now),
                            change.identity_id.as_slice(),
                            neighbor_id.as_slice()
                        ],
                    )
                    .map_err(|_| StorageError::Database)?;
                }
                NeighborApplyItem::Delete { identity_id } => {
                    let thumbnail: Option<Option<Vec<u8>>> = tx
                        .query_row(
                            "SELECT thumbnail_image_id FROM neighbor_identity \
                             WHERE identity_id = ? AND neighbor_id = ?",
                            params![identity_id.as_slice(), neighbor_id.as_slice()],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(|_| StorageError::Database)?;
                    let Some(thumbnail) = thumbnail else {
                        outcome.failure = Some(NeighborApplyFailure {
                            index,
                            field: "delete.identityNetworkId",
                        });
                        break;
                    };
                    if let Some(image) = id16_opt(thumbnail)? {
                        outcome.removed_images.push(image);
                    }
                    tx.execute(
                        "DELETE FROM neighbor_identity \
                         WHERE identity_id = ? AND neighbor_id = ?",
                        params![identity_id.as_slice(), neighbor_id.as_slice()],
                    )
                    .map_err(|_| StorageError::Database)?;
                }
            }
            outcome.applied += 1;
        }
        tx.commit().map_err(|_| StorageError::Database)?;
        Ok(outcome)
    }

    // Followers and the neighborhood action queue.

    /// Admits a follower: checks both admission gates, snapshots the
    /// initialized non-expired identities, inserts the follower row with a
    /// NULL refresh time and the blocking initialization action, all in one
    /// transaction.
    pub async fn admit_follower(
        &self,
        follower: &Follower,
        max_followers: u32,
        max_parallel_init: u32,
        now: DateTime<Utc>,
    ) -> Result<FollowerAdmission, StorageError> {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction().map_err(|_| StorageError::Database)?;
        // A repeated start from the same server restarts its initialization.
        tx.execute(
            "DELETE FROM neighborhood_action WHERE server_id = ?",
            params![follower.follower_id.as_slice()],
        )
        .map_err(|_| StorageError::Database)?;
        tx.execute(
            "DELETE FROM follower WHERE follower_id = ?",
            params![follower.follower_id.as_slice()],
        )
        .map_err(|_| StorageError::Database)?;
        let total: i64 = tx
            .query_row("SELECT COUNT(*) FROM follower", [], |row| row.get(0))
            .map_err(|_| StorageError::Database)?;
        if total >= max_followers as i64 {
            return Ok(FollowerAdmission::TooManyFollowers);
        }
        let initializing: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM follower WHERE last_refresh_at IS NULL",
                [],
                |row| row.get(0),
            )
            .map_err(|_| StorageError::Database)?;
        if initializing >= max_parallel_init as i64 {
            return Ok(FollowerAdmission::TooManyInitializations);
        }
        let snapshot: Vec<HostedIdentity> = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {HOSTED_COLUMNS} FROM hosted_identity \
                     WHERE version != ? AND expiration_at IS NULL ORDER BY rowid"
                ))
                .map_err(|_| StorageError::Database)?;
            let rows = stmt
                .query_map(params![UNINITIALIZED_VERSION.as_slice()], read_hosted_row)
                .map_err(|_| StorageError::Database)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| StorageError::Database)?;
            rows.into_iter()
                .map(HostedIdentity::try_from)
                .collect::<Result<Vec<_>, _>>()?
        };
        tx.execute(
            "INSERT INTO follower (follower_id, ip, primary_port, neighbor_port, last_refresh_at) \
             VALUES (?, ?, ?, ?, NULL)",
            params![
                follower.follower_id.as_slice(),
                follower.ip,
                follower.primary_port as i64,
                follower.neighbor_port as i64
            ],
        )
        .map_err(|_| StorageError::Database)?;
        let block_until = now + Duration::minutes(INITIALIZATION_BLOCK_MINUTES);
        tx.execute(
            "INSERT INTO neighborhood_action (server_id, action_type, created_at, execute_after) \
             VALUES (?, ?, ?, ?)",
            params![
                follower.follower_id.as_slice(),
                ActionType::InitializationInProgress as i64,
                encode_time(&now),
                encode_time(&block_until)
            ],
        )
        .map_err(|_| StorageError::Database)?;
        tx.commit().map_err(|_| StorageError::Database)?;
        Ok(FollowerAdmission::Accepted(snapshot))
    }

    /// Marks a follower initialized and bumps its blocking action backward
    /// so the worker can resolve it; one transaction.
    pub async fn finish_follower_init(
        &self,
        follower_id: &[u8; 32],
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction().map_err(|_| StorageError::Database)?;
        let affected = tx
            .execute(
                "UPDATE follower SET last_refresh_at = ? WHERE follower_id = ?",
                params![encode_time(&now), follower_id.as_slice()],
            )
            .map_err(|_| StorageError::Database)?;
        if affected == 0 {
            return Err(StorageError::Missing);
        }
        tx.execute(
            "UPDATE neighborhood_action SET execute_after = ? \
             WHERE server_id = ? AND action_type = ?",
            params![
                encode_time(&now),
                follower_id.as_slice(),
                ActionType::InitializationInProgress as i64
            ],
        )
        .map_err(|_| StorageError::Database)?;
        tx.commit().map_err(|_| StorageError::Database)?;
        Ok(())
    }

    /// Removes a follower and its queued actions.
    pub async fn remove_follower(&self, follower_id: &[u8; 32]) -> Result<bool, StorageError> {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction().map_err(|_| StorageError::Database)?;
        tx.execute(
            "DELETE FROM neighborhood_action WHERE server_id = ?",
            params![follower_id.as_slice()],
        )
        .map_err(|_| StorageError::Database)?;
        let affected = tx
            .execute(
                "DELETE FROM follower WHERE follower_id = ?",
                params![follower_id.as_slice()],
            )
            .map_err(|_| StorageError::Database)?;
        tx.commit().map_err(|_| StorageError::Database)?;
        Ok(affected > 0)
    }

    pub async fn load_follower(
        &self,
        follower_id: &[u8; 32],
    ) -> Result<Option<Follower>, StorageError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT follower_id, ip, primary_port, neighbor_port, last_refresh_at \
                 FROM follower WHERE follower_id = ?",
                params![follower_id.as_slice()],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(|_| StorageError::Database)?;
        match row {
            None => Ok(None),
            Some(raw) => Ok(Some(Follower {
                follower_id: id32(raw.0)?,
                ip: raw.1,
                primary_port: raw.2 as u16,
                neighbor_port: raw.3 as u16,
                last_refresh_at: decode_time_opt(raw.4)?,
            })),
        }
    }

    pub async fn list_followers(&self) -> Result<Vec<Follower>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT follower_id, ip, primary_port, neighbor_port, last_refresh_at \
                 FROM follower ORDER BY rowid",
            )
            .map_err(|_| StorageError::Database)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .map_err(|_| StorageError::Database)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| StorageError::Database)?;
        rows.into_iter()
            .map(|raw| {
                Ok(Follower {
                    follower_id: id32(raw.0)?,
                    ip: raw.1,
                    primary_port: raw.2 as u16,
                    neighbor_port: raw.3 as u16,
                    last_refresh_at: decode_time_opt(raw.4)?,
                })
            })
            .collect()
    }

    pub async fn mark_follower_refreshed(
        &self,
        follower_id: &[u8; 32],
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE follower SET last_refresh_at = ? \
             WHERE follower_id = ? AND last_refresh_at IS NOT NULL",
            params![encode_time(&now), follower_id.as_slice()],
        )
        .map_err(|_| StorageError::Database)?;
        Ok(())
    }

    /// Claims due actions for delivery and leases them. Only the head of
    /// each follower's queue is eligible, which keeps delivery FIFO per
    /// follower and lets a pending initialization action block the rest.
    pub async fn claim_due_actions(
        &self,
        limit: u32,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<NeighborhoodAction>, StorageError> {
        let mut guard = self.conn.lock().await;
        let tx = guard.transaction().map_err(|_| StorageError::Database)?;
        let raw_actions = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {ACTION_COLUMNS} FROM neighborhood_action a \
                     WHERE (a.execute_after IS NULL OR a.execute_after <= ?) \
                     AND a.action_id = (SELECT MIN(b.action_id) FROM neighborhood_action b \
                     WHERE b.server_id = a.server_id) \
                     ORDER BY a.action_id LIMIT ?",
                ))
                .map_err(|_| StorageError::Database)?;
            let rows = stmt
                .query_map(params![encode_time(&now), limit as i64], read_action_row)
                .map_err(|_| StorageError::Database)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| StorageError::Database)?;
            rows
        };
        let lease_deadline = now + lease;
        let mut actions = Vec::with_capacity(raw_actions.len());
        for raw in raw_actions {
            let mut action = action_from_raw(raw)?;
            tx.execute(
                "UPDATE neighborhood_action SET execute_after = ?, attempts = attempts + 1, \
                 last_error = NULL WHERE action_id = ?",
                params![encode_time(&lease_deadline), action.action_id],
            )
            .map_err(|_| StorageError::Database)?;
            action.attempts += 1;
            action.execute_after = Some(lease_deadline);
            actions.push(action);
        }
        tx.commit().map_err(|_| StorageError::Database)?;
        Ok(actions)
    }

    /// Removes an action once delivery succeeds or it is resolved.
    pub async fn delete_action(&self, action_id: i64) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "DELETE FROM neighborhood_action WHERE action_id = ?",
                params![action_id],
            )
            .map_err(|_| StorageError::Database)?;
        if affected == 0 {
            return Err(StorageError::Missing);
        }
        Ok(())
    }

    /// Reschedules an action after a failed delivery attempt.
    pub async fn reschedule_action(
        &self,
        action_id: i64,
        delay: Duration,
        now: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        let affected = conn
            .execute(
                "UPDATE neighborhood_action SET execute_after = ?, last_error = ? \
                 WHERE action_id = ?",
                params![encode_time(&(now + delay)), error, action_id],
            )
            .map_err(|_| StorageError::Database)?;
        if affected == 0 {
            return Err(StorageError::Missing);
        }
        Ok(())
    }

    pub async fn pending_actions_for(
        &self,
        follower_id: &[u8; 32],
    ) -> Result<Vec<NeighborhoodAction>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ACTION_COLUMNS} FROM neighborhood_action \
                 WHERE server_id = ? ORDER BY action_id"
            ))
            .map_err(|_| StorageError::Database)?;
        let rows = stmt
            .query_map(params![follower_id.as_slice()], read_action_row)
            .map_err(|_| StorageError::Database)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| StorageError::Database)?;
        rows.into_iter().map(action_from_raw).collect()
    }

    /// Every image id still referenced by a hosted or neighbor row.
    pub async fn referenced_image_ids(
        &self,
    ) -> Result<Vec<[u8; IMAGE_ID_LEN]>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT profile_image_id FROM hosted_identity WHERE profile_image_id IS NOT NULL \
                 UNION \
                 SELECT thumbnail_image_id FROM hosted_identity \
                 WHERE thumbnail_image_id IS NOT NULL \
                 UNION \
                 SELECT thumbnail_image_id FROM neighbor_identity \
                 WHERE thumbnail_image_id IS NOT NULL",
            )
            .map_err(|_| StorageError::Database)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))
            .map_err(|_| StorageError::Database)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| StorageError::Database)?;
        rows.into_iter()
            .map(|raw| {
                <[u8; IMAGE_ID_LEN]>::try_from(raw.as_slice())
                    .map_err(|_| StorageError::Serialization)
            })
            .collect()
    }
}

fn insert_follower_actions(
    tx: &rusqlite::Transaction<'_>,
    action_type: ActionType,
    target_identity_id: &[u8; 32],
    now: &DateTime<Utc>,
) -> Result<(), StorageError> {
    let followers: Vec<Vec<u8>> = {
        let mut stmt = tx
            .prepare("SELECT follower_id FROM follower ORDER BY rowid")
            .map_err(|_| StorageError::Database)?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|_| StorageError::Database)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| StorageError::Database)?;
        rows
    };
    for follower_id in followers {
        tx.execute(
            "INSERT INTO neighborhood_action \
             (server_id, action_type, target_identity_id, created_at) VALUES (?, ?, ?, ?)",
            params![
                follower_id,
                action_type as i64,
                target_identity_id.as_slice(),
                encode_time(now)
            ],
        )
        .map_err(|_| StorageError::Database)?;
    }
    Ok(())
}

fn neighbor_identity_images(
    tx: &rusqlite::Transaction<'_>,
    neighbor_id: &[u8; 32],
) -> Result<Vec<[u8; IMAGE_ID_LEN]>, StorageError> {
    let mut stmt = tx
        .prepare(
            "SELECT thumbnail_image_id FROM neighbor_identity \
             WHERE neighbor_id = ? AND thumbnail_image_id IS NOT NULL",
        )
        .map_err(|_| StorageError::Database)?;
    let rows = stmt
        .query_map(params![neighbor_id.as_slice()], |row| {
            row.get::<_, Vec<u8>>(0)
        })
        .map_err(|_| StorageError::Database)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| StorageError::Database)?;
    rows.into_iter()
        .map(|raw| {
            <[u8; IMAGE_ID_LEN]>::try_from(raw.as_slice()).map_err(|_| StorageError::Serialization)
        })
        .collect()
}

fn search_query(
    table: &str,
    columns: &str,
    filter: &SearchFilter,
    offset: u64,
    limit: u64,
) -> (String, Vec<Value>) {
    let mut sql = format!(
        "SELECT {columns} FROM {table} WHERE version != ? \
         AND name LIKE ? ESCAPE '\\' AND identity_type LIKE ? ESCAPE '\\'"
    );
    let mut values: Vec<Value> = vec![
        Value::Blob(UNINITIALIZED_VERSION.to_vec()),
        Value::Text(filter.name_like.clone()),
        Value::Text(filter.type_like.clone()),
    ];
    if let Some(bbox) = &filter.bbox {
        sql.push_str(
            " AND latitude IS NOT NULL AND longitude IS NOT NULL \
             AND latitude >= ? AND latitude <= ?",
        );
        values.push(Value::Real(bbox.min_lat));
        values.push(Value::Real(bbox.max_lat));
        if bbox.min_lon <= bbox.max_lon {
            sql.push_str(" AND longitude >= ? AND longitude <= ?");
        } else {
            // The box straddles the antimeridian.
            sql.push_str(" AND (longitude >= ? OR longitude <= ?)");
        }
        values.push(Value::Real(bbox.min_lon));
        values.push(Value::Real(bbox.max_lon));
    }
    sql.push_str(" ORDER BY rowid LIMIT ? OFFSET ?");
    values.push(Value::Integer(limit as i64));
    values.push(Value::Integer(offset as i64));
    (sql, values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id(tag: u8) -> [u8; 32] {
        [tag; 32]
    }

    fn image_id(tag: u8) -> [u8; IMAGE_ID_LEN] {
        [tag; IMAGE_ID_LEN]
    }

    async fn open_storage() -> Storage {
        let storage = Storage::connect(":memory:").await.unwrap();
        storage.migrate().await.unwrap();
        storage
    }

    fn follower(tag: u8) -> Follower {
        Follower {
            follower_id: test_id(tag),
            ip: "198.51.100.7".to_string(),
            primary_port: 16987,
            neighbor_port: 16988,
            last_refresh_at: None,
        }
    }

    fn initialized_changes(name: &str) -> ProfileChanges {
        ProfileChanges {
            version: Some([1, 0, 0]),
            name: Some(name.to_string()),
            location: Some((50.0, 14.4)),
            ..ProfileChanges::default()
        }
    }

    #[tokio::test]
    async fn register_reactivate_and_quota() {
        let storage = open_storage();
        let storage = storage.await;
        let now = Utc::now();
        let id = test_id(1);
        let outcome = storage
            .register_hosting(&id, &[1u8; 32], now, 2)
            .await
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::Created);
        let outcome = storage
            .register_hosting(&id, &[1u8; 32], now, 2)
            .await
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::AlreadyActive);
        let outcome = storage
            .register_hosting(&test_id(2), &[2u8; 32], now, 2)
            .await
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::Created);
        let outcome = storage
            .register_hosting(&test_id(3), &[3u8; 32], now, 2)
            .await
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::QuotaExceeded);
        // Cancelled identities free a slot and can be reactivated.
        storage.cancel_hosting(&id, None, now).await.unwrap();
        let outcome = storage
            .register_hosting(&id, &[1u8; 32], now, 2)
            .await
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::Reactivated);
        let loaded = storage.load_hosted(&id).await.unwrap().unwrap();
        assert!(loaded.expiration_at.is_none());
    }

    #[tokio::test]
    async fn first_update_requires_version_name_location() {
        let storage = open_storage().await;
        let now = Utc::now();
        let id = test_id(4);
        storage
            .register_hosting(&id, &[4u8; 32], now, 10)
            .await
            .unwrap();
        let partial = ProfileChanges {
            name: Some("Alice".to_string()),
            ..ProfileChanges::default()
        };
        assert!(matches!(
            storage.update_profile(&id, &partial, now).await,
            Err(StorageError::Invalid)
        ));
        let commit = storage
            .update_profile(&id, &initialized_changes("Alice"), now)
            .await
            .unwrap();
        assert!(commit.first_initialization);
        let loaded = storage.load_hosted(&id).await.unwrap().unwrap();
        assert!(loaded.is_initialized());
        assert_eq!(loaded.name, "Alice");
        assert_eq!(loaded.latitude, Some(50.0));
    }

    #[tokio::test]
    async fn profile_update_fans_out_actions_per_follower() {
        let storage = open_storage().await;
        let now = Utc::now();
        let id = test_id(5);
        storage
            .register_hosting(&id, &[5u8; 32], now, 10)
            .await
            .unwrap();
        for tag in [21u8, 22u8] {
            match storage
                .admit_follower(&follower(tag), 10, 10, now)
                .await
                .unwrap()
            {
                FollowerAdmission::Accepted(_) => {}
                other => panic!("unexpected admission: {:?}", other),
            }
            storage
                .finish_follower_init(&test_id(tag), now)
                .await
                .unwrap();
        }
        let commit = storage
            .update_profile(&id, &initialized_changes("Bob"), now)
            .await
            .unwrap();
        assert!(commit.first_initialization);
        for tag in [21u8, 22u8] {
            let actions = storage.pending_actions_for(&test_id(tag)).await.unwrap();
            let add_actions: Vec<_> = actions
                .iter()
                .filter(|action| action.action_type == ActionType::AddProfile)
                .collect();
            assert_eq!(add_actions.len(), 1);
            assert_eq!(add_actions[0].target_identity_id, Some(id));
        }
        // A second update on the now-initialized profile queues a change.
        let more = ProfileChanges {
            extra_data: Some("{}".to_string()),
            ..ProfileChanges::default()
        };
        let commit = storage.update_profile(&id, &more, now).await.unwrap();
        assert!(!commit.first_initialization);
        let actions = storage.pending_actions_for(&test_id(21)).await.unwrap();
        assert!(actions
            .iter()
            .any(|action| action.action_type == ActionType::ChangeProfile));
    }

    #[tokio::test]
    async fn image_replacement_reports_old_blob() {
        let storage = open_storage().await;
        let now = Utc::now();
        let id = test_id(6);
        storage
            .register_hosting(&id, &[6u8; 32], now, 10)
            .await
            .unwrap();
        let mut changes = initialized_changes("Carol");
        changes.profile_image = Some(Some(image_id(1)));
        let commit = storage.update_profile(&id, &changes, now).await.unwrap();
        assert!(commit.removed_images.is_empty());
        let replace = ProfileChanges {
            profile_image: Some(Some(image_id(2))),
            ..ProfileChanges::default()
        };
        let commit = storage.update_profile(&id, &replace, now).await.unwrap();
        assert_eq!(commit.removed_images, vec![image_id(1)]);
        let loaded = storage.load_hosted(&id).await.unwrap().unwrap();
        assert_eq!(loaded.profile_image_id, Some(image_id(2)));
    }

    #[tokio::test]
    async fn cancel_with_redirect_keeps_profile_for_retention_window() {
        let storage = open_storage().await;
        let now = Utc::now();
        let id = test_id(7);
        storage
            .register_hosting(&id, &[7u8; 32], now, 10)
            .await
            .unwrap();
        storage
            .cancel_hosting(&id, Some(test_id(8).to_vec()), now)
            .await
            .unwrap();
        let loaded = storage.load_hosted(&id).await.unwrap().unwrap();
        let expiration = loaded.expiration_at.unwrap();
        assert_eq!(
            (expiration - now).num_days(),
            CANCEL_REDIRECT_RETENTION_DAYS
        );
        assert_eq!(loaded.hosting_redirect_id, Some(test_id(8).to_vec()));
        // Never-initialized profile received a structural version.
        assert_eq!(loaded.version, [1, 0, 0]);
        // Not yet removed by the sweep.
        assert!(storage.load_hosted(&id).await.unwrap().is_some());
        let images = storage
            .delete_expired_hosted(now + Duration::days(15))
            .await
            .unwrap();
        assert!(images.is_empty());
        assert!(storage.load_hosted(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn follower_admission_gates() {
        let storage = open_storage().await;
        let now = Utc::now();
        match storage
            .admit_follower(&follower(31), 1, 1, now)
            .await
            .unwrap()
        {
            FollowerAdmission::Accepted(snapshot) => assert!(snapshot.is_empty()),
            other => panic!("unexpected admission: {:?}", other),
        }
        assert!(matches!(
            storage.admit_follower(&follower(32), 1, 1, now).await.unwrap(),
            FollowerAdmission::TooManyFollowers
        ));
        let storage = open_storage().await;
        match storage
            .admit_follower(&follower(33), 10, 1, now)
            .await
            .unwrap()
        {
            FollowerAdmission::Accepted(_) => {}
            other => panic!("unexpected admission: {:?}", other),
        }
        assert!(matches!(
            storage.admit_follower(&follower(34), 10, 1, now).await.unwrap(),
            FollowerAdmission::TooManyInitializations
        ));
    }

    #[tokio::test]
    async fn initialization_blocker_gates_claims_until_finish() {
        let storage = open_storage().await;
        let now = Utc::now();
        let follower_id = test_id(41);
        match storage
            .admit_follower(&follower(41), 10, 10, now)
            .await
            .unwrap()
        {
            FollowerAdmission::Accepted(_) => {}
            other => panic!("unexpected admission: {:?}", other),
        }
        // The follower row exists with a NULL refresh and a pending blocker.
        let row = storage.load_follower(&follower_id).await.unwrap().unwrap();
        assert!(row.last_refresh_at.is_none());
        let pending = storage.pending_actions_for(&follower_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].action_type,
            ActionType::InitializationInProgress
        );
        assert!(pending[0].execute_after.unwrap() > now);
        // Nothing claimable while the blocker's deadline is in the future.
        let claimed = storage
            .claim_due_actions(16, Duration::seconds(20), now)
            .await
            .unwrap();
        assert!(claimed.is_empty());
        storage
            .finish_follower_init(&follower_id, now)
            .await
            .unwrap();
        let row = storage.load_follower(&follower_id).await.unwrap().unwrap();
        assert!(row.last_refresh_at.is_some());
        let claimed = storage
            .claim_due_actions(16, Duration::seconds(20), now)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(
            claimed[0].action_type,
            ActionType::InitializationInProgress
        );
        storage.delete_action(claimed[0].action_id).await.unwrap();
        assert!(storage
            .pending_actions_for(&follower_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn claims_are_fifo_per_follower() {
        let storage = open_storage().await;
        let now = Utc::now();
        let id = test_id(51);
        let follower_id = test_id(52);
        storage
            .register_hosting(&id, &[51u8; 32], now, 10)
            .await
            .unwrap();
        match storage
            .admit_follower(&follower(52), 10, 10, now)
            .await
            .unwrap()
        {
            FollowerAdmission::Accepted(_) => {}
            other => panic!("unexpected admission: {:?}", other),
        }
        storage
            .finish_follower_init(&follower_id, now)
            .await
            .unwrap();
        // Resolve the blocker.
        let claimed = storage
            .claim_due_actions(16, Duration::seconds(20), now)
            .await
            .unwrap();
        storage.delete_action(claimed[0].action_id).await.unwrap();
        storage
            .update_profile(&id, &initialized_changes("Dora"), now)
            .await
            .unwrap();
        storage
            .cancel_hosting(&id, None, now)
            .await
            .unwrap();
        // Two actions queued; only the head is claimable.
        let claimed = storage
            .claim_due_actions(16, Duration::seconds(20), now)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].action_type, ActionType::AddProfile);
        // The leased head still gates the queue.
        let again = storage
            .claim_due_actions(16, Duration::seconds(20), now)
            .await
            .unwrap();
        assert!(again.is_empty());
        storage.delete_action(claimed[0].action_id).await.unwrap();
        let claimed = storage
            .claim_due_actions(16, Duration::seconds(20), now)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].action_type, ActionType::RemoveProfile);
    }

    #[tokio::test]
    async fn neighbor_add_change_delete_roundtrip() {
        let storage = open_storage().await;
        let now = Utc::now();
        let neighbor_id = test_id(61);
        storage
            .upsert_neighbor(&neighbor_id, Some(now))
            .await
            .unwrap();
        let identity = NeighborIdentity {
            identity_id: test_id(62),
            neighbor_id,
            public_key: vec![62u8; 32],
            version: [1, 0, 0],
            name: "Eve".to_string(),
            identity_type: "individual".to_string(),
            latitude: Some(48.2),
            longitude: Some(16.4),
            extra_data: String::new(),
            thumbnail_image_id: None,
            updated_at: now,
        };
        let items = vec![
            NeighborApplyItem::Add(identity.clone()),
            NeighborApplyItem::Change(NeighborIdentityChange {
                identity_id: identity.identity_id,
                name: Some("Eve II".to_string()),
                ..NeighborIdentityChange::default()
            }),
            NeighborApplyItem::Delete {
                identity_id: identity.identity_id,
            },
        ];
        let outcome = storage
            .apply_neighbor_batch(&neighbor_id, &items, now)
            .await
            .unwrap();
        assert_eq!(outcome.applied, 3);
        assert!(outcome.failure.is_none());
        assert_eq!(
            storage.count_neighbor_identities(&neighbor_id).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn neighbor_duplicate_add_stops_batch() {
        let storage = open_storage().await;
        let now = Utc::now();
        let neighbor_id = test_id(63);
        storage
            .upsert_neighbor(&neighbor_id, Some(now))
            .await
            .unwrap();
        let identity = NeighborIdentity {
            identity_id: test_id(64),
            neighbor_id,
            public_key: vec![64u8; 32],
            version: [1, 0, 0],
            name: "Frank".to_string(),
            identity_type: "individual".to_string(),
            latitude: None,
            longitude: None,
            extra_data: String::new(),
            thumbnail_image_id: None,
            updated_at: now,
        };
        let items = vec![
            NeighborApplyItem::Add(identity.clone()),
            NeighborApplyItem::Add(identity.clone()),
            NeighborApplyItem::Delete {
                identity_id: identity.identity_id,
            },
        ];
        let outcome = storage
            .apply_neighbor_batch(&neighbor_id, &items, now)
            .await
            .unwrap();
        assert_eq!(outcome.applied, 1);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.index, 1);
        assert_eq!(failure.field, "add.identityPublicKey");
        // The first add was committed; the delete after the failure was not.
        assert_eq!(
            storage.count_neighbor_identities(&neighbor_id).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn neighbor_change_missing_identity_fails() {
        let storage = open_storage().await;
        let now = Utc::now();
        let neighbor_id = test_id(65);
        storage
            .upsert_neighbor(&neighbor_id, Some(now))
            .await
            .unwrap();
        let items = vec![NeighborApplyItem::Change(NeighborIdentityChange {
            identity_id: test_id(66),
            name: Some("Ghost".to_string()),
            ..NeighborIdentityChange::default()
        })];
        let outcome = storage
            .apply_neighbor_batch(&neighbor_id, &items, now)
            .await
            .unwrap();
        assert_eq!(outcome.applied, 0);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.index, 0);
        assert_eq!(failure.field, "change.identityNetworkId");
    }

    #[tokio::test]
    async fn related_card_duplicate_and_quota() {
        let storage = open_storage().await;
        let card = RelatedIdentityCard {
            identity_id: test_id(71),
            application_id: vec![1, 2, 3],
            card_id: vec![9; 32],
            card_version: vec![1, 0, 0],
            issuer_public_key: vec![7; 32],
            recipient_public_key: vec![8; 32],
            card_type: "friend".to_string(),
            valid_from: 0,
            valid_to: i64::MAX,
            issuer_signature: vec![0; 64],
            recipient_signature: vec![0; 64],
        };
        assert_eq!(
            storage.add_related_card(&card, 2).await.unwrap(),
            CardOutcome::Added
        );
        assert_eq!(
            storage.add_related_card(&card, 2).await.unwrap(),
            CardOutcome::Duplicate
        );
        let mut second = card.clone();
        second.application_id = vec![4, 5, 6];
        assert_eq!(
            storage.add_related_card(&second, 2).await.unwrap(),
            CardOutcome::Added
        );
        let mut third = card.clone();
        third.application_id = vec![7, 8, 9];
        assert_eq!(
            storage.add_related_card(&third, 2).await.unwrap(),
            CardOutcome::QuotaExceeded
        );
        assert!(storage
            .remove_related_card(&card.identity_id, &card.application_id)
            .await
            .unwrap());
        assert!(!storage
            .remove_related_card(&card.identity_id, &card.application_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn invalid_cards_are_filtered_unless_requested() {
        let storage = open_storage().await;
        let expired = RelatedIdentityCard {
            identity_id: test_id(72),
            application_id: vec![1],
            card_id: vec![9; 32],
            card_version: vec![1, 0, 0],
            issuer_public_key: vec![7; 32],
            recipient_public_key: vec![8; 32],
            card_type: "colleague".to_string(),
            valid_from: 0,
            valid_to: 10,
            issuer_signature: vec![0; 64],
            recipient_signature: vec![0; 64],
        };
        storage.add_related_card(&expired, 10).await.unwrap();
        let now_ms = 1_000_000;
        let valid_only = storage
            .list_related_cards(&expired.identity_id, false, None, None, now_ms)
            .await
            .unwrap();
        assert!(valid_only.is_empty());
        let all = storage
            .list_related_cards(&expired.identity_id, true, None, None, now_ms)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        let by_issuer = storage
            .list_related_cards(&expired.identity_id, true, None, Some(&[1u8; 32]), now_ms)
            .await
            .unwrap();
        assert!(by_issuer.is_empty());
    }

    #[tokio::test]
    async fn search_paging_and_wildcards() {
        let storage = open_storage().await;
        let now = Utc::now();
        for tag in 0..5u8 {
            let id = test_id(100 + tag);
            storage
                .register_hosting(&id, &[100 + tag; 32], now, 100)
                .await
                .unwrap();
            let mut changes = initialized_changes(&format!("user-{tag}"));
            changes.location = Some((50.0 + f64::from(tag), 14.0));
            storage.update_profile(&id, &changes, now).await.unwrap();
        }
        let filter = SearchFilter {
            name_like: wildcard_to_like("user-*"),
            type_like: wildcard_to_like("*"),
            bbox: None,
        };
        let first = storage.search_hosted(&filter, 0, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        let rest = storage.search_hosted(&filter, 3, 3).await.unwrap();
        assert_eq!(rest.len(), 2);
        let none = storage
            .search_hosted(
                &SearchFilter {
                    name_like: wildcard_to_like("nobody-*"),
                    type_like: wildcard_to_like("*"),
                    bbox: None,
                },
                0,
                10,
            )
            .await
            .unwrap();
        assert!(none.is_empty());
        let boxed = storage
            .search_hosted(
                &SearchFilter {
                    name_like: wildcard_to_like("*"),
                    type_like: wildcard_to_like("*"),
                    bbox: Some(BoundingBox {
                        min_lat: 49.5,
                        max_lat: 51.5,
                        min_lon: 13.0,
                        max_lon: 15.0,
                    }),
                },
                0,
                10,
            )
            .await
            .unwrap();
        assert_eq!(boxed.len(), 2);
    }

    #[tokio::test]
    async fn stale_neighbors_are_expired() {
        let storage = open_storage().await;
        let now = Utc::now();
        let fresh = test_id(81);
        let stale = test_id(82);
        storage.upsert_neighbor(&fresh, Some(now)).await.unwrap();
        storage
            .upsert_neighbor(&stale, Some(now - Duration::hours(50)))
            .await
            .unwrap();
        let identity = NeighborIdentity {
            identity_id: test_id(83),
            neighbor_id: stale,
            public_key: vec![83u8; 32],
            version: [1, 0, 0],
            name: "Old".to_string(),
            identity_type: "individual".to_string(),
            latitude: None,
            longitude: None,
            extra_data: String::new(),
            thumbnail_image_id: Some(image_id(9)),
            updated_at: now,
        };
        storage
            .apply_neighbor_batch(&stale, &[NeighborApplyItem::Add(identity)], now)
            .await
            .unwrap();
        let images = storage
            .expire_stale_neighbors(now - Duration::hours(48))
            .await
            .unwrap();
        assert_eq!(images, vec![image_id(9)]);
        assert!(storage.load_neighbor(&stale).await.unwrap().is_none());
        assert!(storage.load_neighbor(&fresh).await.unwrap().is_some());
    }

    #[test]
    fn wildcard_conversion() {
        assert_eq!(wildcard_to_like("*"), "%");
        assert_eq!(wildcard_to_like(""), "%");
        assert_eq!(wildcard_to_like("a?c*"), "a_c%");
        assert_eq!(wildcard_to_like("50%_\\"), "50\\%\\_\\\\");
    }
}
