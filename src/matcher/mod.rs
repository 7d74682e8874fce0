//! Cross-source record matching.
//!
//! Associates attribute rows to geometry rows through an ordered strategy
//! chain: identifier exact match, normalized-address exact match, fuzzy
//! address similarity, then geocode-plus-nearest-parcel spatial matching.
//! Within one pass a geometry row accepts at most one attribute row per
//! source, and an attribute row belongs to at most one geometry row: the
//! first claim wins and later claims are logged as ambiguous rather than
//! silently dropped. Attribute rows that resolve to an already-matched
//! parcel (several tax records sharing one parcel) collapse into it.

use std::collections::HashMap;

use strsim::normalized_levenshtein;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::geocode::GeocodeService;
use crate::geometry::{haversine_m, Coordinate, Crs};
use crate::models::{AttributeRow, GeometryRow, MatchCandidate, MatchStrategy, SourceKind};

/// Per-region matching policy. Both knobs are tuned per observed region data
/// quality, so they come from configuration rather than constants.
#[derive(Debug, Clone, Copy)]
pub struct MatchPolicy {
    /// Minimum normalized-Levenshtein similarity for a fuzzy match.
    pub fuzzy_threshold: f64,
    /// Maximum accepted distance between a geocoded attribute address and a
    /// parcel centroid.
    pub spatial_radius_m: f64,
}

/// Why an attribute row ended the pass without a geometry association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmatchedReason {
    /// The row carries neither identifier nor usable address.
    NoAddress,
    /// No strategy produced an association.
    NoMatch,
    /// The address could not be geocoded.
    GeocodeNotFound,
    /// Geocoded, but no parcel centroid within the radius.
    OutsideRadius,
}

impl UnmatchedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoAddress => "no-address",
            Self::NoMatch => "no-address-match",
            Self::GeocodeNotFound => "geocode-not-found",
            Self::OutsideRadius => "outside-radius",
        }
    }
}

/// An attribute row left without association, for the unmatched export.
#[derive(Debug, Clone)]
pub struct UnmatchedAttribute {
    pub attribute_idx: usize,
    pub reason: UnmatchedReason,
}

/// A later claim on an attribute row that was already taken.
#[derive(Debug, Clone)]
pub struct AmbiguousClaim {
    pub attribute_idx: usize,
    pub first_geometry_idx: usize,
    pub later_geometry_idx: usize,
    pub strategy: MatchStrategy,
}

/// Everything one matching pass produced.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub candidates: Vec<MatchCandidate>,
    pub ambiguous: Vec<AmbiguousClaim>,
    /// Attribute rows absorbed into an already-matched parcel.
    pub collapsed: u64,
    pub unmatched: Vec<UnmatchedAttribute>,
    /// Spatial matches that had more than one candidate inside the radius.
    pub spatial_ambiguous: u64,
}

pub struct Matcher<'a> {
    geocoder: &'a GeocodeService,
    policy: MatchPolicy,
}

impl<'a> Matcher<'a> {
    pub fn new(geocoder: &'a GeocodeService, policy: MatchPolicy) -> Self {
        Self { geocoder, policy }
    }

    /// Match one attribute source against a region's geometry rows.
    pub async fn match_source(
        &self,
        region: &str,
        geometry_rows: &[GeometryRow],
        crs: Crs,
        attribute_rows: &[AttributeRow],
        source: SourceKind,
    ) -> Result<MatchOutcome, StoreError> {
        let mut outcome = MatchOutcome::default();

        // Attribute-side indexes, built once.
        let mut id_index: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut addr_index: HashMap<&str, Vec<usize>> = HashMap::new();
        for (aidx, row) in attribute_rows.iter().enumerate() {
            if let Some(id) = row.identifier.as_deref() {
                id_index.entry(id).or_default().push(aidx);
            }
            if let Some(street) = row.street() {
                if !street.is_empty() {
                    addr_index.entry(street).or_default().push(aidx);
                }
            }
        }

        // attribute idx -> geometry idx that claimed it
        let mut claims: HashMap<usize, usize> = HashMap::new();
        // geometry idx -> accepted attribute idx
        let mut accepted: HashMap<usize, usize> = HashMap::new();
        // Lazily geocoded attribute coordinates, aligned with attribute_rows.
        let mut geocoded: Option<Vec<Option<Coordinate>>> = None;
        // WGS84 centroids, aligned with geometry_rows, computed on first use.
        let mut centroids: Option<Vec<Coordinate>> = None;

        for (gidx, grow) in geometry_rows.iter().enumerate() {
            // 1. Identifier exact match.
            if let Some(candidates) = id_index.get(grow.identifier.as_str()) {
                if self.try_claim(
                    gidx,
                    candidates,
                    MatchStrategy::Identifier,
                    1.0,
                    None,
                    source,
                    &mut claims,
                    &mut accepted,
                    &mut outcome,
                ) {
                    continue;
                }
            }

            // 2. Normalized-address exact match.
            let street = grow.normalized.as_ref().map(|n| n.street.as_str());
            if let Some(street) = street.filter(|s| !s.is_empty()) {
                if let Some(candidates) = addr_index.get(street) {
                    if self.try_claim(
                        gidx,
                        candidates,
                        MatchStrategy::Address,
                        1.0,
                        None,
                        source,
                        &mut claims,
                        &mut accepted,
                        &mut outcome,
                    ) {
                        continue;
                    }
                }

                // 3. Fuzzy address match.
                let mut best: Option<(usize, f64)> = None;
                for (aidx, arow) in attribute_rows.iter().enumerate() {
                    if claims.contains_key(&aidx) {
                        continue;
                    }
                    let Some(candidate_street) = arow.street() else {
                        continue;
                    };
                    let similarity = normalized_levenshtein(street, candidate_street);
                    if similarity >= self.policy.fuzzy_threshold
                        && best.map(|(_, s)| similarity > s).unwrap_or(true)
                    {
                        best = Some((aidx, similarity));
                    }
                }
                if let Some((aidx, similarity)) = best {
                    claims.insert(aidx, gidx);
                    accepted.insert(gidx, aidx);
                    outcome.candidates.push(MatchCandidate {
                        geometry_idx: gidx,
                        attribute_idx: aidx,
                        source,
                        strategy: MatchStrategy::Fuzzy,
                        confidence: similarity,
                        distance_m: None,
                    });
                    continue;
                }
            }

            // 4. Spatial match: geocode attribute addresses, reproject the
            // parcel centroid into the same geographic system, take the
            // nearest candidate inside the radius.
            if geocoded.is_none() {
                geocoded = Some(self.geocode_attributes(region, attribute_rows).await?);
            }
            if centroids.is_none() {
                centroids = Some(
                    geometry_rows
                        .iter()
                        .map(|g| crs.to_wgs84(g.geometry.centroid()))
                        .collect(),
                );
            }
            let coords = geocoded.as_ref().expect("geocoded above");
            let centroid = centroids.as_ref().expect("computed above")[gidx];

            let mut nearest: Option<(usize, f64)> = None;
            let mut in_radius = 0u32;
            for (aidx, coord) in coords.iter().enumerate() {
                if claims.contains_key(&aidx) {
                    continue;
                }
                let Some(coord) = coord else { continue };
                let distance = haversine_m(centroid, *coord);
                if distance <= self.policy.spatial_radius_m {
                    in_radius += 1;
                    if nearest.map(|(_, d)| distance < d).unwrap_or(true) {
                        nearest = Some((aidx, distance));
                    }
                }
            }
            if let Some((aidx, distance)) = nearest {
                if in_radius > 1 {
                    outcome.spatial_ambiguous += 1;
                    warn!(
                        "{region}: {in_radius} {source} rows within {:.0}m of parcel {}, \
                         keeping nearest at {distance:.1}m",
                        self.policy.spatial_radius_m, grow.identifier
                    );
                }
                claims.insert(aidx, gidx);
                accepted.insert(gidx, aidx);
                outcome.candidates.push(MatchCandidate {
                    geometry_idx: gidx,
                    attribute_idx: aidx,
                    source,
                    strategy: MatchStrategy::Spatial,
                    confidence: 1.0 - distance / self.policy.spatial_radius_m,
                    distance_m: Some(distance),
                });
            }
        }

        self.classify_leftovers(
            geometry_rows,
            attribute_rows,
            crs,
            &claims,
            &accepted,
            geocoded.as_deref(),
            &mut outcome,
        );

        debug!(
            "{region}: {source} matching produced {} candidates, {} collapsed, {} unmatched, {} ambiguous claims",
            outcome.candidates.len(),
            outcome.collapsed,
            outcome.unmatched.len(),
            outcome.ambiguous.len()
        );
        Ok(outcome)
    }

    /// Claim the first unclaimed candidate; log later claims as ambiguous.
    /// Returns true when a claim was made.
    #[allow(clippy::too_many_arguments)]
    fn try_claim(
        &self,
        gidx: usize,
        candidates: &[usize],
        strategy: MatchStrategy,
        confidence: f64,
        distance_m: Option<f64>,
        source: SourceKind,
        claims: &mut HashMap<usize, usize>,
        accepted: &mut HashMap<usize, usize>,
        outcome: &mut MatchOutcome,
    ) -> bool {
        for &aidx in candidates {
            match claims.get(&aidx) {
                Some(&first) if first != gidx => {
                    outcome.ambiguous.push(AmbiguousClaim {
                        attribute_idx: aidx,
                        first_geometry_idx: first,
                        later_geometry_idx: gidx,
                        strategy,
                    });
                }
                _ => {
                    claims.insert(aidx, gidx);
                    accepted.insert(gidx, aidx);
                    outcome.candidates.push(MatchCandidate {
                        geometry_idx: gidx,
                        attribute_idx: aidx,
                        source,
                        strategy,
                        confidence,
                        distance_m,
                    });
                    return true;
                }
            }
        }
        false
    }

    async fn geocode_attributes(
        &self,
        region: &str,
        attribute_rows: &[AttributeRow],
    ) -> Result<Vec<Option<Coordinate>>, StoreError> {
        let mut coords = Vec::with_capacity(attribute_rows.len());
        for row in attribute_rows {
            let coord = match row.street() {
                Some(street) if !street.is_empty() => {
                    self.geocoder.resolve(region, street).await?
                }
                _ => None,
            };
            coords.push(coord);
        }
        Ok(coords)
    }

    /// Decide what each unclaimed attribute row means: absorbed into an
    /// already-matched parcel, or genuinely unmatched (and why).
    #[allow(clippy::too_many_arguments)]
    fn classify_leftovers(
        &self,
        geometry_rows: &[GeometryRow],
        attribute_rows: &[AttributeRow],
        crs: Crs,
        claims: &HashMap<usize, usize>,
        accepted: &HashMap<usize, usize>,
        geocoded: Option<&[Option<Coordinate>]>,
        outcome: &mut MatchOutcome,
    ) {
        // Geometry-side street index for collapse detection.
        let mut geom_streets: HashMap<&str, Vec<usize>> = HashMap::new();
        for (gidx, grow) in geometry_rows.iter().enumerate() {
            if let Some(n) = &grow.normalized {
                if !n.street.is_empty() {
                    geom_streets.entry(n.street.as_str()).or_default().push(gidx);
                }
            }
        }

        let centroids: Vec<Coordinate> = if geocoded.is_some() {
            geometry_rows
                .iter()
                .map(|g| crs.to_wgs84(g.geometry.centroid()))
                .collect()
        } else {
            Vec::new()
        };

        for (aidx, arow) in attribute_rows.iter().enumerate() {
            if claims.contains_key(&aidx) {
                continue;
            }

            if arow.identifier.is_none() && arow.street().is_none() {
                outcome.unmatched.push(UnmatchedAttribute {
                    attribute_idx: aidx,
                    reason: UnmatchedReason::NoAddress,
                });
                continue;
            }

            // Same street as a matched parcel: several records per parcel
            // collapse into one.
            if let Some(street) = arow.street() {
                if let Some(gidxs) = geom_streets.get(street) {
                    if gidxs.iter().any(|g| accepted.contains_key(g)) {
                        outcome.collapsed += 1;
                        continue;
                    }
                }
            }

            if let Some(coords) = geocoded {
                match coords[aidx] {
                    None => {
                        outcome.unmatched.push(UnmatchedAttribute {
                            attribute_idx: aidx,
                            reason: UnmatchedReason::GeocodeNotFound,
                        });
                        continue;
                    }
                    Some(coord) => {
                        let mut nearest: Option<(usize, f64)> = None;
                        for (gidx, centroid) in centroids.iter().enumerate() {
                            let d = haversine_m(*centroid, coord);
                            if nearest.map(|(_, best)| d < best).unwrap_or(true) {
                                nearest = Some((gidx, d));
                            }
                        }
                        match nearest {
                            Some((gidx, d)) if d <= self.policy.spatial_radius_m => {
                                if accepted.contains_key(&gidx) {
                                    // Another record on an already-matched
                                    // parcel.
                                    outcome.collapsed += 1;
                                } else {
                                    outcome.unmatched.push(UnmatchedAttribute {
                                        attribute_idx: aidx,
                                        reason: UnmatchedReason::NoMatch,
                                    });
                                }
                            }
                            _ => {
                                outcome.unmatched.push(UnmatchedAttribute {
                                    attribute_idx: aidx,
                                    reason: UnmatchedReason::OutsideRadius,
                                });
                            }
                        }
                        continue;
                    }
                }
            }

            outcome.unmatched.push(UnmatchedAttribute {
                attribute_idx: aidx,
                reason: UnmatchedReason::NoMatch,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::{GeocodeCache, GeocodePolicy, GeocodeProvider};
    use crate::geometry::{Geometry, Xy};
    use crate::normalize;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct FixedProvider(HashMap<String, Coordinate>);

    #[async_trait]
    impl GeocodeProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn lookup(
            &self,
            query: &str,
        ) -> Result<Option<Coordinate>, crate::geocode::GeocodeError> {
            Ok(self.0.get(query).copied())
        }
    }

    fn service(entries: &[(&str, f64, f64)]) -> (GeocodeService, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let cache = GeocodeCache::open(&dir.path().join("cache.db")).unwrap();
        let table = entries
            .iter()
            .map(|(q, lat, lon)| {
                (
                    q.to_string(),
                    Coordinate {
                        latitude: *lat,
                        longitude: *lon,
                    },
                )
            })
            .collect();
        let policy = GeocodePolicy {
            min_interval: std::time::Duration::from_millis(0),
            max_retries: 0,
            backoff: std::time::Duration::from_millis(1),
        };
        (
            GeocodeService::new(Arc::new(FixedProvider(table)), cache, policy),
            dir,
        )
    }

    fn geom_row(identifier: &str, address: Option<&str>, x: f64, y: f64, line: usize) -> GeometryRow {
        GeometryRow {
            identifier: identifier.to_string(),
            geometry: Geometry::Point(Xy { x, y }),
            wkt: format!("POINT({x} {y})"),
            raw_address: address.map(|s| s.to_string()),
            normalized: address.map(normalize::normalize),
            line,
        }
    }

    fn attr_row(identifier: Option<&str>, address: Option<&str>, line: usize) -> AttributeRow {
        AttributeRow {
            source: SourceKind::Authoritative,
            identifier: identifier.map(|s| s.to_string()),
            raw_address: address.map(|s| s.to_string()),
            normalized: address.map(normalize::normalize),
            fields: BTreeMap::new(),
            line,
        }
    }

    fn policy() -> MatchPolicy {
        MatchPolicy {
            fuzzy_threshold: 0.85,
            spatial_radius_m: 150.0,
        }
    }

    #[tokio::test]
    async fn test_identifier_match_wins_over_address() {
        let (svc, _dir) = service(&[]);
        let matcher = Matcher::new(&svc, policy());
        let geometry = vec![geom_row("12-1", Some("12 Main St"), -72.8, 41.8, 2)];
        let attrs = vec![
            attr_row(Some("99-9"), Some("12 Main St"), 2),
            attr_row(Some("12-1"), Some("999 Other Rd"), 3),
        ];
        let outcome = matcher
            .match_source("avon", &geometry, Crs::Geographic, &attrs, SourceKind::Authoritative)
            .await
            .unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        let c = &outcome.candidates[0];
        assert_eq!(c.strategy, MatchStrategy::Identifier);
        assert_eq!(c.attribute_idx, 1);
    }

    #[tokio::test]
    async fn test_address_match_after_identifier_fails() {
        let (svc, _dir) = service(&[]);
        let matcher = Matcher::new(&svc, policy());
        let geometry = vec![geom_row("12-1", Some("12 Main Street"), -72.8, 41.8, 2)];
        let attrs = vec![attr_row(None, Some("12 MAIN ST"), 2)];
        let outcome = matcher
            .match_source("avon", &geometry, Crs::Geographic, &attrs, SourceKind::Authoritative)
            .await
            .unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].strategy, MatchStrategy::Address);
    }

    #[tokio::test]
    async fn test_fuzzy_match_above_threshold() {
        let (svc, _dir) = service(&[]);
        let matcher = Matcher::new(&svc, policy());
        let geometry = vec![geom_row("12-1", Some("12 Mane Street"), -72.8, 41.8, 2)];
        let attrs = vec![attr_row(None, Some("12 Main Street"), 2)];
        let outcome = matcher
            .match_source("avon", &geometry, Crs::Geographic, &attrs, SourceKind::Authoritative)
            .await
            .unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        let c = &outcome.candidates[0];
        assert_eq!(c.strategy, MatchStrategy::Fuzzy);
        assert!(c.confidence >= 0.85);
    }

    #[tokio::test]
    async fn test_spatial_match_requires_reprojection() {
        // Geometry in Connecticut state plane feet; the attribute address
        // geocodes to the same physical spot in WGS84.
        let crs = Crs::from_code("EPSG:2234").unwrap();
        let known = Coordinate {
            latitude: 41.81,
            longitude: -72.83,
        };
        let grid = crs.from_wgs84(known);

        let (svc, _dir) = service(&[("7 RIVER ROAD", known.latitude, known.longitude)]);
        let matcher = Matcher::new(&svc, policy());
        let geometry = vec![geom_row("7", None, grid.x, grid.y, 2)];
        let attrs = vec![attr_row(None, Some("7 River Rd"), 2)];
        let outcome = matcher
            .match_source("avon", &geometry, crs, &attrs, SourceKind::Authoritative)
            .await
            .unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        let c = &outcome.candidates[0];
        assert_eq!(c.strategy, MatchStrategy::Spatial);
        assert!(c.distance_m.unwrap() < 500.0, "distance {:?}", c.distance_m);
    }

    #[tokio::test]
    async fn test_first_claim_wins_later_claim_logged() {
        let (svc, _dir) = service(&[]);
        let matcher = Matcher::new(&svc, policy());
        // Two geometry rows, both carrying the identifier of the single
        // attribute row.
        let geometry = vec![
            geom_row("12-1", None, -72.8, 41.8, 2),
            geom_row("12-1", None, -72.81, 41.81, 3),
        ];
        let attrs = vec![attr_row(Some("12-1"), None, 2)];
        let outcome = matcher
            .match_source("avon", &geometry, Crs::Geographic, &attrs, SourceKind::Authoritative)
            .await
            .unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].geometry_idx, 0);
        assert_eq!(outcome.ambiguous.len(), 1);
        assert_eq!(outcome.ambiguous[0].later_geometry_idx, 1);
    }

    #[tokio::test]
    async fn test_shared_address_rows_collapse() {
        let (svc, _dir) = service(&[]);
        let matcher = Matcher::new(&svc, policy());
        let geometry = vec![geom_row("12-1", Some("12 Main St"), -72.8, 41.8, 2)];
        // Three tax records on one parcel.
        let attrs = vec![
            attr_row(None, Some("12 Main St"), 2),
            attr_row(None, Some("12 Main Street"), 3),
            attr_row(None, Some("12 MAIN ST"), 4),
        ];
        let outcome = matcher
            .match_source("avon", &geometry, Crs::Geographic, &attrs, SourceKind::Authoritative)
            .await
            .unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.collapsed, 2);
        assert!(outcome.unmatched.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_reasons() {
        let (svc, _dir) = service(&[]);
        let matcher = Matcher::new(&svc, policy());
        let geometry = vec![geom_row("1", None, -72.8, 41.8, 2)];
        let attrs = vec![
            attr_row(None, None, 2),
            attr_row(None, Some("99 Nowhere Ln"), 3),
        ];
        let outcome = matcher
            .match_source("avon", &geometry, Crs::Geographic, &attrs, SourceKind::Authoritative)
            .await
            .unwrap();
        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.unmatched.len(), 2);
        assert_eq!(outcome.unmatched[0].reason, UnmatchedReason::NoAddress);
        assert_eq!(outcome.unmatched[1].reason, UnmatchedReason::GeocodeNotFound);
    }
}
