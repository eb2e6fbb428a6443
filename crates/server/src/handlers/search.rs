//! Profile search: SQL-level prefiltering in batches, exact distance and
//! extra-data refinement in memory, bounded wall-clock budgets and the
//! per-session result cache for partial retrieval.

use portico_proto::messages::{
    conversation_response, GpsLocation, IdentityNetworkProfileInformation, ProfileSearchPartRequest,
    ProfileSearchPartResponse, ProfileSearchRequest, ProfileSearchResponse, Status,
};
use portico_proto::Response;
use portico_storage::{BoundingBox, SearchFilter, StorageError};
use regex::Regex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::dispatch::{HandlerResult, Outcome};
use crate::node::SharedNode;
use crate::session::SessionHandle;

const MAX_RESPONSE_WITH_IMAGES: u32 = 100;
const MAX_RESPONSE_WITHOUT_IMAGES: u32 = 1000;
const MAX_TOTAL_WITH_IMAGES: u32 = 1000;
const MAX_TOTAL_WITHOUT_IMAGES: u32 = 10_000;
const MAX_PATTERN_BYTES: usize = 64;
const MAX_EXTRA_DATA_PATTERN_BYTES: usize = 256;
/// Whole-search wall clock budget.
const SEARCH_TIME_BUDGET: Duration = Duration::from_secs(15);
/// Budget for all extra-data regex evaluations combined.
const REGEX_TOTAL_BUDGET: Duration = Duration::from_millis(1000);
/// Budget for a single profile's regex evaluation.
const REGEX_PROFILE_BUDGET: Duration = Duration::from_millis(25);

const EARTH_RADIUS_M: f64 = 6_371_000.0;
const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

fn invalid(details: &str) -> HandlerResult {
    (
        Some(Response::error(Status::InvalidValue, details)),
        Outcome::Continue,
    )
}

/// Great-circle distance in metres.
fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Conservative bounding box around a centre and radius; the exact distance
/// check runs on every candidate afterwards. Longitude may wrap.
fn bounding_box(latitude: f64, longitude: f64, radius_m: f64) -> BoundingBox {
    let lat_delta = radius_m / METERS_PER_DEGREE_LAT;
    let min_lat = (latitude - lat_delta).max(-90.0);
    let max_lat = (latitude + lat_delta).min(90.0);
    let cos_lat = latitude.to_radians().cos().abs();
    if cos_lat < 1e-6 || lat_delta >= 90.0 {
        // Near the poles every longitude is close.
        return BoundingBox {
            min_lat,
            max_lat,
            min_lon: -180.0,
            max_lon: 180.0,
        };
    }
    let lon_delta = radius_m / (METERS_PER_DEGREE_LAT * cos_lat);
    if lon_delta >= 180.0 {
        return BoundingBox {
            min_lat,
            max_lat,
            min_lon: -180.0,
            max_lon: 180.0,
        };
    }
    let mut min_lon = longitude - lon_delta;
    let mut max_lon = longitude + lon_delta;
    if min_lon < -180.0 {
        min_lon += 360.0;
    }
    if max_lon > 180.0 {
        max_lon -= 360.0;
    }
    BoundingBox {
        min_lat,
        max_lat,
        min_lon,
        max_lon,
    }
}

struct CandidateFilter {
    started: Instant,
    center: Option<(f64, f64)>,
    radius_m: f64,
    regex: Option<Regex>,
    regex_spent: Duration,
}

impl CandidateFilter {
    fn time_left(&self) -> bool {
        self.started.elapsed() < SEARCH_TIME_BUDGET
    }

    /// Exact refinement of one candidate. Over-budget regex evaluation is a
    /// non-match.
    fn matches(&mut self, latitude: Option<f64>, longitude: Option<f64>, extra: &str) -> bool {
        if let Some((center_lat, center_lon)) = self.center {
            let (Some(latitude), Some(longitude)) = (latitude, longitude) else {
                return false;
            };
            if haversine_distance_m(center_lat, center_lon, latitude, longitude) > self.radius_m {
                return false;
            }
        }
        if let Some(regex) = &self.regex {
            if self.regex_spent >= REGEX_TOTAL_BUDGET {
                return false;
            }
            let before = Instant::now();
            let matched = regex.is_match(extra);
            let spent = before.elapsed();
            self.regex_spent += spent;
            if spent > REGEX_PROFILE_BUDGET {
                return false;
            }
            if !matched {
                return false;
            }
        }
        true
    }
}

/// `ProfileSearch`: bounded multi-repository search with caching.
pub async fn handle_profile_search(
    node: &SharedNode,
    session: &SessionHandle,
    request: ProfileSearchRequest,
) -> HandlerResult {
    let (max_response_cap, max_total_cap) = if request.include_thumbnail_images {
        (MAX_RESPONSE_WITH_IMAGES, MAX_TOTAL_WITH_IMAGES)
    } else {
        (MAX_RESPONSE_WITHOUT_IMAGES, MAX_TOTAL_WITHOUT_IMAGES)
    };
    if request.max_response_record_count == 0
        || request.max_response_record_count > max_response_cap
        || request.max_response_record_count > request.max_total_record_count
    {
        return invalid("maxResponseRecordCount");
    }
    if request.max_total_record_count > max_total_cap {
        return invalid("maxTotalRecordCount");
    }
    if request.name.len() > MAX_PATTERN_BYTES {
        return invalid("name");
    }
    if request.identity_type.len() > MAX_PATTERN_BYTES {
        return invalid("type");
    }
    let center = if request.radius > 0 {
        let Some(location) = &request.location else {
            return invalid("location");
        };
        if !(-90.0..=90.0).contains(&location.latitude) {
            return invalid("latitude");
        }
        if !(-180.0..=180.0).contains(&location.longitude) {
            return invalid("longitude");
        }
        Some((location.latitude, location.longitude))
    } else {
        None
    };
    let regex = if request.extra_data.is_empty() {
        None
    } else {
        if request.extra_data.len() > MAX_EXTRA_DATA_PATTERN_BYTES {
            return invalid("extraData");
        }
        match Regex::new(&request.extra_data) {
            Ok(regex) => Some(regex),
            Err(_) => return invalid("extraData"),
        }
    };

    let filter = SearchFilter {
        name_like: portico_storage::wildcard_to_like(&request.name),
        type_like: portico_storage::wildcard_to_like(&request.identity_type),
        bbox: center.map(|(lat, lon)| bounding_box(lat, lon, f64::from(request.radius))),
    };
    let mut refine = CandidateFilter {
        started: Instant::now(),
        center,
        radius_m: f64::from(request.radius),
        regex,
        regex_spent: Duration::ZERO,
    };

    let max_total = request.max_total_record_count as usize;
    let mut profiles: Vec<IdentityNetworkProfileInformation> = Vec::new();

    // Local repository first.
    let mut offset = 0u64;
    'hosted: while profiles.len() < max_total && refine.time_left() {
        let remaining = max_total - profiles.len();
        let batch = 1000.max(10 * remaining) as u64;
        let rows = match node.storage.search_hosted(&filter, offset, batch).await {
            Ok(rows) => rows,
            Err(err) => return storage_failure(&err),
        };
        let row_count = rows.len() as u64;
        for row in rows {
            if !refine.time_left() {
                break 'hosted;
            }
            if !refine.matches(row.latitude, row.longitude, &row.extra_data) {
                continue;
            }
            let thumbnail_image = if request.include_thumbnail_images {
                read_thumbnail(node, row.thumbnail_image_id.as_ref()).await
            } else {
                Vec::new()
            };
            profiles.push(IdentityNetworkProfileInformation {
                is_hosted: true,
                identity_public_key: row.public_key,
                version: row.version.to_vec(),
                name: row.name,
                identity_type: row.identity_type,
                location: location_of(row.latitude, row.longitude),
                extra_data: row.extra_data,
                thumbnail_image,
                hosting_server_id: Vec::new(),
            });
            if profiles.len() >= max_total {
                break 'hosted;
            }
        }
        if row_count < batch {
            break;
        }
        offset += batch;
    }

    // Neighbor repository, unless the caller wants local results only.
    let mut queried_neighbors = false;
    if !request.include_hosted_only && profiles.len() < max_total && refine.time_left() {
        queried_neighbors = true;
        let mut offset = 0u64;
        'neighbor: while profiles.len() < max_total && refine.time_left() {
            let remaining = max_total - profiles.len();
            let batch = 1000.max(10 * remaining) as u64;
            let rows = match node.storage.search_neighbor(&filter, offset, batch).await {
                Ok(rows) => rows,
                Err(err) => return storage_failure(&err),
            };
            let row_count = rows.len() as u64;
            for row in rows {
                if !refine.time_left() {
                    break 'neighbor;
                }
                if !refine.matches(row.latitude, row.longitude, &row.extra_data) {
                    continue;
                }
                let thumbnail_image = if request.include_thumbnail_images {
                    read_thumbnail(node, row.thumbnail_image_id.as_ref()).await
                } else {
                    Vec::new()
                };
                profiles.push(IdentityNetworkProfileInformation {
                    is_hosted: false,
                    identity_public_key: row.public_key,
                    version: row.version.to_vec(),
                    name: row.name,
                    identity_type: row.identity_type,
                    location: location_of(row.latitude, row.longitude),
                    extra_data: row.extra_data,
                    thumbnail_image,
                    hosting_server_id: row.neighbor_id.to_vec(),
                });
                if profiles.len() >= max_total {
                    break 'neighbor;
                }
            }
            if row_count < batch {
                break;
            }
            offset += batch;
        }
    }

    // The coverage report is best effort; it is not atomic with the query.
    let mut covered_servers = vec![node.server_id.to_vec()];
    if queried_neighbors {
        match node.storage.list_neighbor_ids().await {
            Ok(ids) => covered_servers.extend(ids.into_iter().map(|id| id.to_vec())),
            Err(err) => warn!(error = %err, "neighbor coverage listing failed"),
        }
    }

    let total = profiles.len() as u32;
    let max_response = request.max_response_record_count as usize;
    let immediate = if profiles.len() > max_response {
        let immediate = profiles[..max_response].to_vec();
        let mut state = session.state.lock().await;
        state.search_cache = Some(profiles);
        immediate
    } else {
        profiles
    };
    (
        Some(Response::conversation_ok(
            conversation_response::Part::ProfileSearch(ProfileSearchResponse {
                total_record_count: total,
                max_response_record_count: request.max_response_record_count,
                profiles: immediate,
                covered_servers,
            }),
        )),
        Outcome::Continue,
    )
}

/// `ProfileSearchPart`: a slice of the cached result set.
pub async fn handle_profile_search_part(
    session: &SessionHandle,
    request: ProfileSearchPartRequest,
) -> HandlerResult {
    let state = session.state.lock().await;
    let Some(cache) = &state.search_cache else {
        return (
            Some(Response::error(Status::NotAvailable, "")),
            Outcome::Continue,
        );
    };
    let len = cache.len() as u32;
    if request.record_index >= len {
        return invalid("recordIndex");
    }
    if request.record_count == 0 || request.record_index + request.record_count > len {
        return invalid("recordCount");
    }
    let start = request.record_index as usize;
    let end = start + request.record_count as usize;
    let profiles = cache[start..end].to_vec();
    (
        Some(Response::conversation_ok(
            conversation_response::Part::ProfileSearchPart(ProfileSearchPartResponse {
                record_index: request.record_index,
                record_count: request.record_count,
                profiles,
            }),
        )),
        Outcome::Continue,
    )
}

fn location_of(latitude: Option<f64>, longitude: Option<f64>) -> Option<GpsLocation> {
    match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(GpsLocation {
            latitude,
            longitude,
        }),
        _ => None,
    }
}

async fn read_thumbnail(node: &SharedNode, image_id: Option<&[u8; 16]>) -> Vec<u8> {
    let Some(image_id) = image_id else {
        return Vec::new();
    };
    match node.images.read(image_id).await {
        Ok(Some(data)) => data,
        Ok(None) => Vec::new(),
        Err(err) => {
            warn!(error = %err, "thumbnail read failed");
            Vec::new()
        }
    }
}

fn storage_failure(err: &StorageError) -> HandlerResult {
    warn!(error = %err, "search query failed");
    (
        Some(Response::error(Status::Internal, "")),
        Outcome::Continue,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        // Prague to Brno is roughly 185 km.
        let distance = haversine_distance_m(50.0755, 14.4378, 49.1951, 16.6068);
        assert!((150_000.0..220_000.0).contains(&distance), "{distance}");
    }

    #[test]
    fn haversine_zero_distance() {
        assert!(haversine_distance_m(50.0, 14.0, 50.0, 14.0) < 1.0);
    }

    #[test]
    fn bounding_box_contains_center() {
        let bbox = bounding_box(50.0, 14.0, 100_000.0);
        assert!(bbox.min_lat < 50.0 && bbox.max_lat > 50.0);
        assert!(bbox.min_lon < 14.0 && bbox.max_lon > 14.0);
    }

    #[test]
    fn bounding_box_wraps_at_antimeridian() {
        let bbox = bounding_box(0.0, 179.9, 100_000.0);
        assert!(bbox.min_lon > bbox.max_lon);
    }

    #[test]
    fn bounding_box_widens_at_poles() {
        let bbox = bounding_box(89.9, 0.0, 100_000.0);
        assert_eq!(bbox.min_lon, -180.0);
        assert_eq!(bbox.max_lon, 180.0);
    }

    #[test]
    fn exhausted_regex_budget_is_a_non_match() {
        let mut filter = CandidateFilter {
            started: Instant::now(),
            center: None,
            radius_m: 0.0,
            regex: Some(Regex::new("match").unwrap()),
            regex_spent: REGEX_TOTAL_BUDGET,
        };
        assert!(!filter.matches(None, None, "match"));
    }

    #[test]
    fn distance_filter_rejects_far_candidates() {
        let mut filter = CandidateFilter {
            started: Instant::now(),
            center: Some((50.0, 14.0)),
            radius_m: 1_000.0,
            regex: None,
            regex_spent: Duration::ZERO,
        };
        assert!(filter.matches(Some(50.001), Some(14.001), ""));
        assert!(!filter.matches(Some(51.0), Some(15.0), ""));
        // Missing coordinates never match a radius filter.
        assert!(!filter.matches(None, None, ""));
    }
}
