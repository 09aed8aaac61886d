use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Food categories a donation or request can be filed under
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FoodCategory {
    Pulses,
    PackagedFood,
    ProduceFresh,
    CookedFood,
    Other,
}

impl FoodCategory {
    pub const ALL: [FoodCategory; 5] = [
        FoodCategory::Pulses,
        FoodCategory::PackagedFood,
        FoodCategory::ProduceFresh,
        FoodCategory::CookedFood,
        FoodCategory::Other,
    ];

    /// Share of market value the category keeps once donated.
    /// Shelf-stable food holds value better than cooked food.
    pub fn value_retention(&self) -> f64 {
        match self {
            FoodCategory::Pulses => 0.90,
            FoodCategory::PackagedFood => 0.85,
            FoodCategory::ProduceFresh => 0.70,
            FoodCategory::CookedFood => 0.60,
            FoodCategory::Other => 0.80,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FoodCategory::Pulses => "PULSES",
            FoodCategory::PackagedFood => "PACKAGED_FOOD",
            FoodCategory::ProduceFresh => "PRODUCE_FRESH",
            FoodCategory::CookedFood => "COOKED_FOOD",
            FoodCategory::Other => "OTHER",
        }
    }
}

impl fmt::Display for FoodCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown labels fall back to `Other`, which carries the mid-range factor.
impl FromStr for FoodCategory {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(|c: char| c == ' ' || c == '-', "_");
        Ok(match normalized.as_str() {
            "PULSES" => FoodCategory::Pulses,
            "PACKAGED_FOOD" | "PACKAGEDFOOD" => FoodCategory::PackagedFood,
            "PRODUCE_FRESH" | "PRODUCEFRESH" | "FRESH_PRODUCE" => FoodCategory::ProduceFresh,
            "COOKED_FOOD" | "COOKEDFOOD" => FoodCategory::CookedFood,
            _ => FoodCategory::Other,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuantityUnit {
    Kilograms,
    Litres,
    Servings,
    Packets,
    Units,
}

impl QuantityUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantityUnit::Kilograms => "KILOGRAMS",
            QuantityUnit::Litres => "LITRES",
            QuantityUnit::Servings => "SERVINGS",
            QuantityUnit::Packets => "PACKETS",
            QuantityUnit::Units => "UNITS",
        }
    }
}

impl fmt::Display for QuantityUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantityUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "KILOGRAMS" | "KG" => Ok(QuantityUnit::Kilograms),
            "LITRES" | "L" => Ok(QuantityUnit::Litres),
            "SERVINGS" => Ok(QuantityUnit::Servings),
            "PACKETS" => Ok(QuantityUnit::Packets),
            "UNITS" => Ok(QuantityUnit::Units),
            other => Err(format!("unknown quantity unit: {}", other)),
        }
    }
}

/// A unit-tagged amount of food
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Quantity {
    pub amount: f64,
    pub unit: QuantityUnit,
}

impl Quantity {
    pub fn new(amount: f64, unit: QuantityUnit) -> Self {
        Self { amount, unit }
    }

    pub fn is_positive(&self) -> bool {
        self.amount.is_finite() && self.amount > 0.0
    }

    /// Whether this lot can cover `wanted` in full.
    pub fn covers(&self, wanted: &Quantity) -> bool {
        self.unit == wanted.unit && self.amount >= wanted.amount
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_category_defaults_to_other() {
        let category: FoodCategory = "frozen desserts".parse().unwrap();
        assert_eq!(category, FoodCategory::Other);
        assert_eq!(category.value_retention(), 0.80);

        let category: FoodCategory = "packaged-food".parse().unwrap();
        assert_eq!(category, FoodCategory::PackagedFood);
    }

    #[test]
    fn test_category_round_trips_through_str() {
        for category in FoodCategory::ALL {
            assert_eq!(category.as_str().parse::<FoodCategory>().unwrap(), category);
        }
    }

    #[test]
    fn test_quantity_covers_requires_same_unit() {
        let lot = Quantity::new(25.0, QuantityUnit::Kilograms);

        assert!(lot.covers(&Quantity::new(20.0, QuantityUnit::Kilograms)));
        assert!(lot.covers(&Quantity::new(25.0, QuantityUnit::Kilograms)));
        assert!(!lot.covers(&Quantity::new(30.0, QuantityUnit::Kilograms)));
        assert!(!lot.covers(&Quantity::new(5.0, QuantityUnit::Litres)));
    }
}
