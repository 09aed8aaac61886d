pub mod category;
pub mod pricing;

pub use category::{FoodCategory, Quantity, QuantityUnit};
pub use pricing::{PriceBreakdown, Priceable, PricingConfig, PricingEngine, PricingError, PricingInput};
