use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foodlink_core::models::{AssignmentStatus, Bill, DeliveryAssignment, Donation, FoodRequest};
use foodlink_core::repository::{
    AssignmentFilter, BillFilter, Change, Committed, DonationFilter, EntityKind, EntityStore,
    OutboxEntry, RequestFilter, StoreError, StoreResult, UnitOfWork,
};
use foodlink_shared::EventEnvelope;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct State {
    donations: HashMap<Uuid, Donation>,
    requests: HashMap<Uuid, FoodRequest>,
    assignments: HashMap<Uuid, DeliveryAssignment>,
    bills: HashMap<Uuid, Bill>,
    outbox: Vec<OutboxRow>,
    last_position: i64,
}

struct OutboxRow {
    position: i64,
    envelope: EventEnvelope,
}

/// Copy-on-write overlay for one unit. Nothing reaches `State` until every
/// change in the unit has passed its guard.
#[derive(Default)]
struct Staged {
    donations: HashMap<Uuid, Donation>,
    touched: Vec<Uuid>,
    requests: HashMap<Uuid, FoodRequest>,
    assignments: HashMap<Uuid, DeliveryAssignment>,
    bills: HashMap<Uuid, Bill>,
    events: Vec<EventEnvelope>,
}

impl Staged {
    fn donation_mut<'a>(&'a mut self, base: &State, id: Uuid) -> StoreResult<&'a mut Donation> {
        if !self.touched.contains(&id) {
            self.touched.push(id);
        }
        match self.donations.entry(id) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let current = base.donations.get(&id).cloned().ok_or(StoreError::NotFound {
                    entity: EntityKind::Donation,
                    id,
                })?;
                Ok(v.insert(current))
            }
        }
    }

    fn request_mut<'a>(&'a mut self, base: &State, id: Uuid) -> StoreResult<&'a mut FoodRequest> {
        match self.requests.entry(id) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let current = base.requests.get(&id).cloned().ok_or(StoreError::NotFound {
                    entity: EntityKind::Request,
                    id,
                })?;
                Ok(v.insert(current))
            }
        }
    }

    fn assignment_mut<'a>(
        &'a mut self,
        base: &State,
        id: Uuid,
    ) -> StoreResult<&'a mut DeliveryAssignment> {
        match self.assignments.entry(id) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let current = base.assignments.get(&id).cloned().ok_or(StoreError::NotFound {
                    entity: EntityKind::Assignment,
                    id,
                })?;
                Ok(v.insert(current))
            }
        }
    }

    fn bill_mut<'a>(&'a mut self, base: &State, id: Uuid) -> StoreResult<&'a mut Bill> {
        match self.bills.entry(id) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let current = base.bills.get(&id).cloned().ok_or(StoreError::NotFound {
                    entity: EntityKind::Bill,
                    id,
                })?;
                Ok(v.insert(current))
            }
        }
    }

    /// Another accepted assignment for the same donation, staged or stored
    fn accepted_elsewhere(&self, base: &State, donation_id: Uuid, except: Uuid) -> bool {
        let staged = self.assignments.values().any(|a| {
            a.id != except && a.donation_id == donation_id && a.status == AssignmentStatus::Accepted
        });
        let stored = base.assignments.values().any(|a| {
            a.id != except
                && a.donation_id == donation_id
                && a.status == AssignmentStatus::Accepted
                && !self.assignments.contains_key(&a.id)
        });
        staged || stored
    }

    fn apply(&mut self, base: &State, change: &Change, at: DateTime<Utc>) -> StoreResult<()> {
        match change {
            Change::Donation(c) => {
                let donation = self.donation_mut(base, c.id)?;
                c.check(donation, at)
                    .map_err(|detail| StoreError::conflict(EntityKind::Donation, c.id, detail))?;
                c.apply(donation, at);
            }
            Change::Request(c) => {
                let request = self.request_mut(base, c.id)?;
                c.check(request)
                    .map_err(|detail| StoreError::conflict(EntityKind::Request, c.id, detail))?;
                c.apply(request, at);
            }
            Change::Assignment(c) => {
                let assignment = self.assignment_mut(base, c.id)?;
                c.check(assignment)
                    .map_err(|detail| StoreError::conflict(EntityKind::Assignment, c.id, detail))?;
                c.apply(assignment, at);
                let donation_id = assignment.donation_id;
                if c.to == AssignmentStatus::Accepted
                    && self.accepted_elsewhere(base, donation_id, c.id)
                {
                    return Err(StoreError::conflict(
                        EntityKind::Assignment,
                        c.id,
                        "donation already has an accepted assignment",
                    ));
                }
            }
            Change::Bill(c) => {
                let bill = self.bill_mut(base, c.id)?;
                c.check(bill)
                    .map_err(|detail| StoreError::conflict(EntityKind::Bill, c.id, detail))?;
                c.apply(bill, at);
            }
            Change::NewAssignment(a) => {
                if base.assignments.contains_key(&a.id) || self.assignments.contains_key(&a.id) {
                    return Err(StoreError::Duplicate {
                        entity: EntityKind::Assignment,
                        id: a.id,
                    });
                }
                self.assignments.insert(a.id, a.clone());
            }
            Change::NewBill(b) => {
                if base.bills.contains_key(&b.id) || self.bills.contains_key(&b.id) {
                    return Err(StoreError::Duplicate {
                        entity: EntityKind::Bill,
                        id: b.id,
                    });
                }
                self.bills.insert(b.id, b.clone());
            }
            Change::Emit(event) => {
                let donation = self.donation_mut(base, event.donation_id())?;
                donation.version += 1;
                let sequence = donation.version;
                self.events
                    .push(EventEnvelope::new(event.clone(), sequence, at));
            }
        }
        Ok(())
    }
}

impl State {
    fn merge(&mut self, staged: Staged) -> Committed {
        let Staged {
            mut donations,
            touched,
            requests,
            assignments,
            bills,
            events,
        } = staged;

        let mut committed = Committed::default();
        for id in touched {
            if let Some(donation) = donations.remove(&id) {
                committed.donations.push(donation.clone());
                self.donations.insert(id, donation);
            }
        }
        self.requests.extend(requests);
        self.assignments.extend(assignments);
        self.bills.extend(bills);

        for envelope in events {
            self.last_position += 1;
            self.outbox.push(OutboxRow {
                position: self.last_position,
                envelope: envelope.clone(),
            });
            committed.events.push(envelope);
        }
        committed
    }
}

/// Process-local `EntityStore`. One writer at a time; the lock is held only
/// for the synchronous check-and-apply of a single unit.
#[derive(Default)]
pub struct InMemoryEntityStore {
    state: RwLock<State>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn limited<T>(mut rows: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    rows
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn insert_donation(&self, donation: &Donation) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.donations.contains_key(&donation.id) {
            return Err(StoreError::Duplicate {
                entity: EntityKind::Donation,
                id: donation.id,
            });
        }
        state.donations.insert(donation.id, donation.clone());
        Ok(())
    }

    async fn insert_request(&self, request: &FoodRequest) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.requests.contains_key(&request.id) {
            return Err(StoreError::Duplicate {
                entity: EntityKind::Request,
                id: request.id,
            });
        }
        state.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn donation(&self, id: Uuid) -> StoreResult<Option<Donation>> {
        Ok(self.state.read().await.donations.get(&id).cloned())
    }

    async fn request(&self, id: Uuid) -> StoreResult<Option<FoodRequest>> {
        Ok(self.state.read().await.requests.get(&id).cloned())
    }

    async fn assignment(&self, id: Uuid) -> StoreResult<Option<DeliveryAssignment>> {
        Ok(self.state.read().await.assignments.get(&id).cloned())
    }

    async fn bill(&self, id: Uuid) -> StoreResult<Option<Bill>> {
        Ok(self.state.read().await.bills.get(&id).cloned())
    }

    async fn donations(&self, filter: &DonationFilter) -> StoreResult<Vec<Donation>> {
        let state = self.state.read().await;
        let mut rows: Vec<Donation> = state
            .donations
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(limited(rows, filter.limit))
    }

    async fn requests(&self, filter: &RequestFilter) -> StoreResult<Vec<FoodRequest>> {
        let state = self.state.read().await;
        let mut rows: Vec<FoodRequest> = state
            .requests
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(limited(rows, filter.limit))
    }

    async fn assignments(&self, filter: &AssignmentFilter) -> StoreResult<Vec<DeliveryAssignment>> {
        let state = self.state.read().await;
        let mut rows: Vec<DeliveryAssignment> = state
            .assignments
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.offered_at.cmp(&b.offered_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn bills(&self, filter: &BillFilter) -> StoreResult<Vec<Bill>> {
        let state = self.state.read().await;
        let mut rows: Vec<Bill> = state
            .bills
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn commit(&self, unit: UnitOfWork) -> StoreResult<Committed> {
        let mut state = self.state.write().await;
        let mut staged = Staged::default();
        for change in &unit.changes {
            if let Err(e) = staged.apply(&state, change, unit.at) {
                debug!(error = %e, "Unit of work rejected");
                return Err(e);
            }
        }
        Ok(state.merge(staged))
    }

    async fn pending_events(&self, limit: usize) -> StoreResult<Vec<OutboxEntry>> {
        let state = self.state.read().await;
        Ok(state
            .outbox
            .iter()
            .take(limit)
            .map(|row| OutboxEntry {
                position: row.position,
                envelope: row.envelope.clone(),
            })
            .collect())
    }

    /// Published rows are dropped; only pending rows stay in memory.
    async fn mark_published(&self, positions: &[i64]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let before = state.outbox.len();
        state.outbox.retain(|row| !positions.contains(&row.position));
        debug!(pruned = before - state.outbox.len(), "Outbox rows published");
        Ok(())
    }
}
