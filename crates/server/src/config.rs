use portico_crypto::hex::decode_hex;
use portico_crypto::IdentityKeyPair;
use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub primary_port: u16,
    pub server_neighbor_port: u16,
    pub client_non_customer_port: u16,
    pub client_customer_port: u16,
    pub client_app_service_port: u16,
    pub keepalive_seconds: u64,
    pub database_path: String,
    pub image_dir: String,
    pub identity_keys: IdentityKeyPair,
    pub max_hosted_identities: u32,
    pub max_identity_relations: u32,
    pub max_follower_servers: u32,
    pub neighborhood_init_parallelism: u32,
    pub max_application_services: u32,
    pub relay_pairing_seconds: u64,
    pub call_notification_seconds: u64,
    pub neighborhood_peers: Vec<String>,
    pub sweep_interval_seconds: u64,
    pub neighbor_expiration_hours: i64,
}

/// Loads the server configuration from the filesystem with environment
/// overrides.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let bind_address = override_env("PORTICO_BIND", map.remove("server.bind_address"))?
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let primary_port = parse_port("PORTICO_PRIMARY_PORT", &mut map, "server.primary_port", 16987)?;
    let server_neighbor_port = parse_port(
        "PORTICO_SERVER_NEIGHBOR_PORT",
        &mut map,
        "server.server_neighbor_port",
        16988,
    )?;
    let client_non_customer_port = parse_port(
        "PORTICO_CLIENT_NON_CUSTOMER_PORT",
        &mut map,
        "server.client_non_customer_port",
        16989,
    )?;
    let client_customer_port = parse_port(
        "PORTICO_CLIENT_CUSTOMER_PORT",
        &mut map,
        "server.client_customer_port",
        16990,
    )?;
    let client_app_service_port = parse_port(
        "PORTICO_CLIENT_APP_SERVICE_PORT",
        &mut map,
        "server.client_app_service_port",
        16991,
    )?;
    let keepalive_seconds =
        parse_u64("PORTICO_KEEPALIVE", &mut map, "server.keepalive_seconds", 60)?;

    let database_path = override_env("PORTICO_DB", map.remove("storage.database_path"))?
        .unwrap_or_else(|| "portico.db".to_string());
    let image_dir = override_env("PORTICO_IMAGE_DIR", map.remove("storage.image_dir"))?
        .unwrap_or_else(|| "images".to_string());

    let identity_seed_hex = required(override_env(
        "PORTICO_IDENTITY_SEED",
        map.remove("crypto.identity_seed"),
    )?)?;
    let identity_seed = decode_hex(&identity_seed_hex).map_err(|_| ConfigError::Invalid)?;
    let identity_keys =
        IdentityKeyPair::from_seed(&identity_seed).map_err(|_| ConfigError::Invalid)?;

    let max_hosted_identities = parse_u32(
        "PORTICO_MAX_HOSTED",
        &mut map,
        "limits.max_hosted_identities",
        10_000,
    )?;
    let max_identity_relations = parse_u32(
        "PORTICO_MAX_RELATIONS",
        &mut map,
        "limits.max_identity_relations",
        100,
    )?;
    let max_follower_servers = parse_u32(
        "PORTICO_MAX_FOLLOWERS",
        &mut map,
        "limits.max_follower_servers",
        200,
    )?;
    let neighborhood_init_parallelism = parse_u32(
        "PORTICO_INIT_PARALLELISM",
        &mut map,
        "limits.neighborhood_init_parallelism",
        3,
    )?;
    let max_application_services = parse_u32(
        "PORTICO_MAX_APP_SERVICES",
        &mut map,
        "limits.max_application_services",
        32,
    )?;
    let relay_pairing_seconds = parse_u64(
        "PORTICO_RELAY_PAIRING",
        &mut map,
        "limits.relay_pairing_seconds",
        60,
    )?;
    let call_notification_seconds = parse_u64(
        "PORTICO_CALL_NOTIFICATION",
        &mut map,
        "limits.call_notification_seconds",
        30,
    )?;

    let peers_raw = override_env("PORTICO_NEIGHBORHOOD_PEERS", map.remove("neighborhood.peers"))?;
    let neighborhood_peers = parse_peers(peers_raw.unwrap_or_default());

    let sweep_interval_seconds = parse_u64(
        "PORTICO_SWEEP_INTERVAL",
        &mut map,
        "sweep.interval_seconds",
        60,
    )?;
    let neighbor_expiration_hours = parse_u64(
        "PORTICO_NEIGHBOR_EXPIRATION",
        &mut map,
        "sweep.neighbor_expiration_hours",
        48,
    )? as i64;

    Ok(ServerConfig {
        bind_address,
        primary_port,
        server_neighbor_port,
        client_non_customer_port,
        client_customer_port,
        client_app_service_port,
        keepalive_seconds,
        database_path,
        image_dir,
        identity_keys,
        max_hosted_identities,
        max_identity_relations,
        max_follower_servers,
        neighborhood_init_parallelism,
        max_application_services,
        relay_pairing_seconds,
        call_notification_seconds,
        neighborhood_peers,
        sweep_interval_seconds,
        neighbor_expiration_hours,
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

fn parse_u64(
    env_key: &str,
    map: &mut HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    override_env(env_key, map.remove(key))?
        .map(|value| value.parse::<u64>().map_err(|_| ConfigError::Invalid))
        .unwrap_or(Ok(default))
}

fn parse_u32(
    env_key: &str,
    map: &mut HashMap<String, String>,
    key: &str,
    default: u32,
) -> Result<u32, ConfigError> {
    override_env(env_key, map.remove(key))?
        .map(|value| value.parse::<u32>().map_err(|_| ConfigError::Invalid))
        .unwrap_or(Ok(default))
}

fn parse_port(
    env_key: &str,
    map: &mut HashMap<String, String>,
    key: &str,
    default: u16,
) -> Result<u16, ConfigError> {
    override_env(env_key, map.remove(key))?
        .map(|value| value.parse::<u16>().map_err(|_| ConfigError::Invalid))
        .unwrap_or(Ok(default))
}

fn parse_peers(raw: String) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn parse_configuration_minimal() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("portico_test_config.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind_address=\"127.0.0.1\"\nprimary_port=\"26987\"\n[storage]\ndatabase_path=\":memory:\"\n[crypto]\nidentity_seed=\"000102030405060708090a0b0c0d0e0f000102030405060708090a0b0c0d0e0f\"\n[limits]\nmax_hosted_identities=\"50\"\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.primary_port, 26987);
        assert_eq!(config.server_neighbor_port, 16988);
        assert_eq!(config.keepalive_seconds, 60);
        assert_eq!(config.max_hosted_identities, 50);
        assert_eq!(config.neighborhood_init_parallelism, 3);
        assert!(config.neighborhood_peers.is_empty());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_identity_seed_is_rejected() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("portico_test_config_incomplete.toml");
        fs::File::create(&path)
            .unwrap()
            .write_all(b"[server]\nbind_address=\"127.0.0.1\"\n")
            .unwrap();
        assert!(matches!(
            load_configuration(&path),
            Err(ConfigError::Missing)
        ));
        fs::remove_file(path).unwrap();
    }
}
