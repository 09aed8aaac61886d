use chrono::{DateTime, Utc};
use foodlink_catalog::{PriceBreakdown, PricingEngine};
use foodlink_core::location::Location;
use foodlink_core::models::{Donation, DonationStatus, FoodRequest, RequestStatus};
use foodlink_core::repository::{DonationFilter, EntityKind, EntityStore, RequestFilter};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{FulfillmentError, FulfillmentResult};

pub const DEFAULT_MATCH_RADIUS_KM: f64 = 15.0;

/// A donation a request could claim, with its current price
#[derive(Debug, Clone)]
pub struct DonationMatch {
    pub donation: Donation,
    pub distance_km: Option<f64>,
    pub price: PriceBreakdown,
}

/// A pending request a donation could serve
#[derive(Debug, Clone)]
pub struct RequestMatch {
    pub request: FoodRequest,
    pub distance_km: Option<f64>,
}

/// Finds compatible donation/request pairs. Read-only; a match is only a
/// suggestion until the claim commits.
pub struct MatchFinder {
    store: Arc<dyn EntityStore>,
    pricing: PricingEngine,
    radius_km: f64,
}

impl MatchFinder {
    pub fn new(store: Arc<dyn EntityStore>, pricing: PricingEngine, radius_km: f64) -> Self {
        Self {
            store,
            pricing,
            radius_km,
        }
    }

    /// Coordinates win when both sides have them; otherwise fall back to
    /// the same location label.
    fn proximity(&self, a: &Location, b: &Location) -> Option<Option<f64>> {
        match a.distance_km(b) {
            Some(d) if d <= self.radius_km => Some(Some(d)),
            Some(_) => None,
            None if a.same_label(b) => Some(None),
            None => None,
        }
    }

    /// Available donations the request could claim right now, nearest
    /// first, then soonest to spoil.
    pub async fn donations_for_request(
        &self,
        request_id: Uuid,
        now: DateTime<Utc>,
    ) -> FulfillmentResult<Vec<DonationMatch>> {
        let request = self
            .store
            .request(request_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found(EntityKind::Request, request_id))?;
        if request.status != RequestStatus::Pending {
            return Ok(Vec::new());
        }

        let candidates = self
            .store
            .donations(&DonationFilter {
                statuses: Some(vec![DonationStatus::Available]),
                category: Some(request.category),
                ..Default::default()
            })
            .await?;
        let scanned = candidates.len();

        let mut matches = Vec::new();
        for donation in candidates {
            if donation.effective_status(now) != DonationStatus::Available {
                continue;
            }
            if !donation.quantity.covers(&request.quantity) {
                continue;
            }
            let Some(distance_km) = self.proximity(&donation.location, &request.location) else {
                continue;
            };
            let price = self.pricing.compute_price(&donation, now)?;
            matches.push(DonationMatch {
                donation,
                distance_km,
                price,
            });
        }

        matches.sort_by(|a, b| {
            by_distance(a.distance_km, b.distance_km)
                .then(a.donation.spoil_deadline.cmp(&b.donation.spoil_deadline))
        });

        debug!(
            request_id = %request_id,
            scanned,
            matched = matches.len(),
            "Donation matches computed"
        );
        Ok(matches)
    }

    /// Pending requests a donation could serve, most urgent first
    pub async fn requests_for_donation(
        &self,
        donation_id: Uuid,
        now: DateTime<Utc>,
    ) -> FulfillmentResult<Vec<RequestMatch>> {
        let donation = self
            .store
            .donation(donation_id)
            .await?
            .ok_or_else(|| FulfillmentError::not_found(EntityKind::Donation, donation_id))?;
        if donation.effective_status(now) != DonationStatus::Available {
            return Ok(Vec::new());
        }

        let candidates = self
            .store
            .requests(&RequestFilter {
                statuses: Some(vec![RequestStatus::Pending]),
                category: Some(donation.category),
                ..Default::default()
            })
            .await?;

        let mut matches: Vec<RequestMatch> = candidates
            .into_iter()
            .filter(|r| donation.quantity.covers(&r.quantity))
            .filter_map(|r| {
                self.proximity(&donation.location, &r.location)
                    .map(|distance_km| RequestMatch {
                        request: r,
                        distance_km,
                    })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.request
                .urgency
                .cmp(&a.request.urgency)
                .then(by_distance(a.distance_km, b.distance_km))
                .then(a.request.created_at.cmp(&b.request.created_at))
        });
        Ok(matches)
    }
}

/// Known distances first, ascending
fn by_distance(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
