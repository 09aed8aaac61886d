//! Transition tables for every record with a status.
//!
//! Each table is a closed `(state, event) -> state` match. Anything not
//! listed is rejected before a change is ever sent to the store.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{AssignmentStatus, BillStatus, DonationStatus, RequestStatus};
use crate::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DonationEvent {
    Claim,
    ConfirmPayment,
    Release,
    StartPickup,
    Deliver,
    Settle,
    Expire,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestEvent {
    Claim,
    Begin,
    Release,
    Complete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentEvent {
    Accept,
    Decline,
    Withdraw,
    Complete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillEvent {
    Finalize,
    Fail,
    Refund,
}

macro_rules! debug_display {
    ($($ty:ty),+) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        })+
    };
}

debug_display!(DonationEvent, RequestEvent, AssignmentEvent, BillEvent);

fn rejected(entity: &'static str, from: impl fmt::Display, event: impl fmt::Display) -> CoreError {
    CoreError::InvalidTransition {
        entity,
        from: from.to_string(),
        event: event.to_string(),
    }
}

impl DonationStatus {
    pub fn next(self, event: DonationEvent) -> CoreResult<DonationStatus> {
        use DonationEvent as E;
        use DonationStatus as S;

        match (self, event) {
            (S::Available, E::Claim) => Ok(S::Claimed),
            (S::Claimed, E::ConfirmPayment) => Ok(S::AwaitingPickup),
            (S::Claimed | S::AwaitingPickup, E::Release) => Ok(S::Available),
            (S::AwaitingPickup, E::StartPickup) => Ok(S::InTransit),
            (S::InTransit, E::Deliver) => Ok(S::Delivered),
            (S::Delivered, E::Settle) => Ok(S::Billed),
            (S::Available | S::Claimed | S::AwaitingPickup | S::InTransit, E::Expire) => {
                Ok(S::Expired)
            }
            (from, event) => Err(rejected("donation", from, event)),
        }
    }
}

impl RequestStatus {
    pub fn next(self, event: RequestEvent) -> CoreResult<RequestStatus> {
        use RequestEvent as E;
        use RequestStatus as S;

        match (self, event) {
            (S::Pending, E::Claim) => Ok(S::Claimed),
            (S::Claimed, E::Begin) => Ok(S::InProgress),
            (S::Claimed | S::InProgress, E::Release) => Ok(S::Pending),
            (S::InProgress, E::Complete) => Ok(S::Completed),
            (from, event) => Err(rejected("request", from, event)),
        }
    }
}

impl AssignmentStatus {
    pub fn next(self, event: AssignmentEvent) -> CoreResult<AssignmentStatus> {
        use AssignmentEvent as E;
        use AssignmentStatus as S;

        match (self, event) {
            (S::Offered, E::Accept) => Ok(S::Accepted),
            (S::Offered | S::Accepted, E::Decline | E::Withdraw) => Ok(S::Declined),
            (S::Accepted, E::Complete) => Ok(S::Completed),
            (from, event) => Err(rejected("assignment", from, event)),
        }
    }
}

impl BillStatus {
    pub fn next(self, event: BillEvent) -> CoreResult<BillStatus> {
        use BillEvent as E;
        use BillStatus as S;

        match (self, event) {
            (S::Pending, E::Finalize) => Ok(S::Completed),
            (S::Pending, E::Fail) => Ok(S::Failed),
            (S::Pending, E::Refund) => Ok(S::Refunded),
            (from, event) => Err(rejected("bill", from, event)),
        }
    }
}
