use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::category::FoodCategory;

/// Below this many hours to spoilage the time factor is at its floor.
pub const FLOOR_HOURS: f64 = 1.0;
/// Beyond this many hours to spoilage the donation keeps its full value.
pub const FULL_VALUE_HOURS: f64 = 72.0;
/// Minimum share of value left on food that is about to spoil.
pub const TIME_FACTOR_FLOOR: f64 = 0.10;

/// Everything the pricing engine needs to know about a lot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingInput {
    /// Listed market value of the whole lot
    pub listed_value: i64,

    /// Amount in the lot's own unit
    pub quantity: f64,

    pub category: FoodCategory,

    /// Absolute time after which the food is void
    pub spoil_deadline: DateTime<Utc>,
}

/// Anything that can be priced
pub trait Priceable {
    fn pricing_input(&self) -> PricingInput;
}

impl Priceable for PricingInput {
    fn pricing_input(&self) -> PricingInput {
        self.clone()
    }
}

/// Decomposed price, kept on the bill and shown to requesters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub listed_value: i64,
    pub quantity: f64,
    pub category: FoodCategory,
    pub hours_until_spoil: f64,
    pub time_factor: f64,
    pub quantity_factor: f64,
    pub category_factor: f64,
    pub time_factor_percent: i64,
    pub quantity_factor_percent: i64,
    pub category_factor_percent: i64,
    pub unit_price: f64,
    pub final_price: i64,
    pub discount_percent: i64,
    pub priced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Share of the final price retained by the platform
    pub platform_fee_fraction: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            platform_fee_fraction: 0.05,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PricingError {
    #[error("Invalid pricing input: {0}")]
    InvalidPricingInput(String),

    #[error("Invalid pricing config: {0}")]
    InvalidConfig(String),
}

/// Time-decayed pricing. Stateless apart from its config; `now` is always
/// supplied by the caller.
#[derive(Debug, Clone)]
pub struct PricingEngine {
    config: PricingConfig,
}

impl PricingEngine {
    pub fn new(config: PricingConfig) -> Result<Self, PricingError> {
        let fee = config.platform_fee_fraction;
        if !fee.is_finite() || !(0.0..1.0).contains(&fee) {
            return Err(PricingError::InvalidConfig(format!(
                "platform_fee_fraction must be in [0, 1), got {}",
                fee
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    /// Price a lot as of `now`.
    pub fn compute_price<P: Priceable + ?Sized>(
        &self,
        item: &P,
        now: DateTime<Utc>,
    ) -> Result<PriceBreakdown, PricingError> {
        let input = item.pricing_input();

        if input.listed_value <= 0 {
            return Err(PricingError::InvalidPricingInput(format!(
                "listed value must be positive, got {}",
                input.listed_value
            )));
        }
        if !input.quantity.is_finite() || input.quantity <= 0.0 {
            return Err(PricingError::InvalidPricingInput(format!(
                "quantity must be positive, got {}",
                input.quantity
            )));
        }

        let hours_until_spoil =
            (input.spoil_deadline - now).num_milliseconds() as f64 / 3_600_000.0;

        let time_factor = Self::time_factor(hours_until_spoil);
        let quantity_factor = Self::quantity_factor(input.quantity);
        let category_factor = input.category.value_retention();

        let listed = input.listed_value as f64;
        let unit_price =
            (listed / input.quantity) * time_factor * quantity_factor * category_factor;
        let final_price = (unit_price * input.quantity).round() as i64;
        let discount_percent = ((1.0 - final_price as f64 / listed) * 100.0).round() as i64;

        Ok(PriceBreakdown {
            listed_value: input.listed_value,
            quantity: input.quantity,
            category: input.category,
            hours_until_spoil,
            time_factor,
            quantity_factor,
            category_factor,
            time_factor_percent: as_percent(time_factor),
            quantity_factor_percent: as_percent(quantity_factor),
            category_factor_percent: as_percent(category_factor),
            unit_price,
            final_price,
            discount_percent,
            priced_at: now,
        })
    }

    /// Linear decay from 1.0 at 72h down to the floor at 1h. Already-spoiled
    /// food clamps to the floor.
    pub fn time_factor(hours_until_spoil: f64) -> f64 {
        if hours_until_spoil <= FLOOR_HOURS {
            TIME_FACTOR_FLOOR
        } else if hours_until_spoil > FULL_VALUE_HOURS {
            1.0
        } else {
            TIME_FACTOR_FLOOR
                + (1.0 - TIME_FACTOR_FLOOR) * (hours_until_spoil - FLOOR_HOURS)
                    / (FULL_VALUE_HOURS - FLOOR_HOURS)
        }
    }

    /// Bulk tiers
    pub fn quantity_factor(quantity: f64) -> f64 {
        if quantity >= 100.0 {
            0.70
        } else if quantity >= 50.0 {
            0.80
        } else if quantity >= 20.0 {
            0.90
        } else {
            1.00
        }
    }

    /// Platform cut of a final price, rounded to whole units.
    pub fn platform_fee(&self, final_price: i64) -> i64 {
        (final_price as f64 * self.config.platform_fee_fraction).round() as i64
    }
}

impl Default for PricingEngine {
    fn default() -> Self {
        Self {
            config: PricingConfig::default(),
        }
    }
}

fn as_percent(factor: f64) -> i64 {
    (factor * 100.0).round() as i64
}
