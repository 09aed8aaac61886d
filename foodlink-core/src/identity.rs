use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Donor,
    Requester,
    DeliveryPartner,
    Operator,
}

/// An already-authenticated caller, as supplied by the identity service.
/// The core trusts it and only checks role and ownership.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Uuid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn donor(id: Uuid) -> Self {
        Self::new(id, Role::Donor)
    }

    pub fn requester(id: Uuid) -> Self {
        Self::new(id, Role::Requester)
    }

    pub fn partner(id: Uuid) -> Self {
        Self::new(id, Role::DeliveryPartner)
    }

    pub fn operator(id: Uuid) -> Self {
        Self::new(id, Role::Operator)
    }

    pub fn is_operator(&self) -> bool {
        self.role == Role::Operator
    }

    /// True if the actor is `owner` in `role`, or an operator.
    pub fn acts_for(&self, role: Role, owner: Uuid) -> bool {
        self.is_operator() || (self.role == role && self.id == owner)
    }
}
