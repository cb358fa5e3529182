//! Case classification and per-case order plans
//!
//! A case is selected from where the current price sits inside the swing,
//! measured as the retracement ratio `r = (price - low) / (high - low)`.
//! Zones are closed-open, so a price exactly on a boundary belongs to the
//! higher case. Every case carries a [`CasePlan`] record that says how to
//! enter and where the protective orders go, all expressed as ratios that
//! [`CasePlan::resolve`] turns into prices against a [`LevelSet`].

use serde::{Deserialize, Serialize};
use std::fmt;

use super::levels::LevelSet;

/// Trading case, ordered by how deep into the swing the price has retraced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Case {
    #[serde(rename = "CASE_1")]
    Case1,
    #[serde(rename = "CASE_2")]
    Case2,
    #[serde(rename = "CASE_3")]
    Case3,
    #[serde(rename = "CASE_4")]
    Case4,
}

impl Case {
    pub const ALL: [Case; 4] = [Case::Case1, Case::Case2, Case::Case3, Case::Case4];

    pub fn as_str(&self) -> &'static str {
        match self {
            Case::Case1 => "CASE_1",
            Case::Case2 => "CASE_2",
            Case::Case3 => "CASE_3",
            Case::Case4 => "CASE_4",
        }
    }

    pub fn from_name(name: &str) -> Option<Case> {
        Case::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Case {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a case enters the market
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPlan {
    /// Primary LIMIT sell plus a linked secondary LIMIT sell higher up
    TwoLimits { primary: f64, secondary: f64 },
    /// MARKET sell now plus a linked secondary LIMIT sell
    MarketPlusLimit { secondary: f64 },
    /// Single LIMIT sell
    Limit { ratio: f64 },
    /// Single MARKET sell
    Market,
}

impl EntryPlan {
    pub fn has_secondary(&self) -> bool {
        matches!(
            self,
            EntryPlan::TwoLimits { .. } | EntryPlan::MarketPlusLimit { .. }
        )
    }

    pub fn order_count(&self) -> usize {
        if self.has_secondary() {
            2
        } else {
            1
        }
    }
}

/// Per-case parameters. All prices are retracement ratios of the swing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CasePlan {
    pub entry: EntryPlan,
    pub take_profit: f64,
    /// Take profit used once the secondary entry has filled
    #[serde(default)]
    pub dynamic_take_profit: Option<f64>,
    pub stop_loss: f64,
    /// A pending entry is abandoned if price falls to this ratio before filling
    #[serde(default)]
    pub cancel_below: Option<f64>,
}

/// Concrete prices of a case plan for one swing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPlan {
    /// `None` for a market entry
    pub primary_price: Option<f64>,
    pub secondary_price: Option<f64>,
    pub take_profit: f64,
    pub dynamic_take_profit: Option<f64>,
    pub stop_loss: f64,
    pub cancel_below: Option<f64>,
}

impl CasePlan {
    pub fn resolve(&self, levels: &LevelSet) -> ResolvedPlan {
        let (primary_price, secondary_price) = match self.entry {
            EntryPlan::TwoLimits { primary, secondary } => {
                (Some(levels.price_at(primary)), Some(levels.price_at(secondary)))
            }
            EntryPlan::MarketPlusLimit { secondary } => (None, Some(levels.price_at(secondary))),
            EntryPlan::Limit { ratio } => (Some(levels.price_at(ratio)), None),
            EntryPlan::Market => (None, None),
        };

        ResolvedPlan {
            primary_price,
            secondary_price,
            take_profit: levels.price_at(self.take_profit),
            dynamic_take_profit: self.dynamic_take_profit.map(|r| levels.price_at(r)),
            stop_loss: levels.price_at(self.stop_loss),
            cancel_below: self.cancel_below.map(|r| levels.price_at(r)),
        }
    }

    /// Ratios at which entries rest, primary first
    fn entry_ratios(&self) -> Vec<f64> {
        match self.entry {
            EntryPlan::TwoLimits { primary, secondary } => vec![primary, secondary],
            EntryPlan::MarketPlusLimit { secondary } => vec![secondary],
            EntryPlan::Limit { ratio } => vec![ratio],
            EntryPlan::Market => vec![],
        }
    }
}

/// Lower bounds of the four case zones
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaseBoundaries {
    pub case_1: f64,
    pub case_2: f64,
    pub case_3: f64,
    pub case_4: f64,
}

impl Default for CaseBoundaries {
    fn default() -> Self {
        Self {
            case_1: 0.50,
            case_2: 0.618,
            case_3: 0.786,
            case_4: 1.00,
        }
    }
}

/// Boundaries plus the plan record of each case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaseTable {
    pub boundaries: CaseBoundaries,
    /// Prices retraced beyond this ratio invalidate the swing
    pub max_ratio: Option<f64>,
    pub case_1: CasePlan,
    pub case_2: CasePlan,
    pub case_3: CasePlan,
    pub case_4: CasePlan,
}

impl Default for CaseTable {
    fn default() -> Self {
        Self {
            boundaries: CaseBoundaries::default(),
            max_ratio: None,
            case_1: CasePlan {
                entry: EntryPlan::TwoLimits {
                    primary: 0.618,
                    secondary: 0.786,
                },
                take_profit: 0.45,
                dynamic_take_profit: Some(0.50),
                stop_loss: 1.00,
                cancel_below: Some(0.20),
            },
            case_2: CasePlan {
                entry: EntryPlan::MarketPlusLimit { secondary: 0.786 },
                take_profit: 0.45,
                dynamic_take_profit: Some(0.50),
                stop_loss: 1.00,
                cancel_below: None,
            },
            case_3: CasePlan {
                entry: EntryPlan::Limit { ratio: 0.786 },
                take_profit: 0.55,
                dynamic_take_profit: None,
                stop_loss: 1.05,
                cancel_below: Some(0.30),
            },
            case_4: CasePlan {
                entry: EntryPlan::Market,
                take_profit: 0.60,
                dynamic_take_profit: None,
                stop_loss: 1.05,
                cancel_below: None,
            },
        }
    }
}

impl CaseTable {
    pub fn plan(&self, case: Case) -> &CasePlan {
        match case {
            Case::Case1 => &self.case_1,
            Case::Case2 => &self.case_2,
            Case::Case3 => &self.case_3,
            Case::Case4 => &self.case_4,
        }
    }

    /// Select the case for a retracement ratio, `None` outside every zone
    pub fn classify(&self, ratio: f64) -> Option<Case> {
        if !ratio.is_finite() {
            return None;
        }
        if let Some(max) = self.max_ratio {
            if ratio >= max {
                return None;
            }
        }

        let b = &self.boundaries;
        if ratio >= b.case_4 {
            Some(Case::Case4)
        } else if ratio >= b.case_3 {
            Some(Case::Case3)
        } else if ratio >= b.case_2 {
            Some(Case::Case2)
        } else if ratio >= b.case_1 {
            Some(Case::Case1)
        } else {
            None
        }
    }

    /// Check the table describes a coherent short setup
    pub fn validate(&self) -> Result<(), String> {
        let b = &self.boundaries;
        if !(b.case_1 < b.case_2 && b.case_2 < b.case_3 && b.case_3 < b.case_4) {
            return Err(format!(
                "case boundaries must be strictly increasing: {} < {} < {} < {}",
                b.case_1, b.case_2, b.case_3, b.case_4
            ));
        }
        if let Some(max) = self.max_ratio {
            if max <= b.case_4 {
                return Err(format!("max_ratio {} must exceed case_4 boundary {}", max, b.case_4));
            }
        }

        for case in Case::ALL {
            let plan = self.plan(case);
            let entries = plan.entry_ratios();

            // Every entry rests between the target and the stop
            for ratio in &entries {
                if *ratio <= plan.take_profit || *ratio >= plan.stop_loss {
                    return Err(format!(
                        "{}: entry ratio {} must lie between take_profit {} and stop_loss {}",
                        case, ratio, plan.take_profit, plan.stop_loss
                    ));
                }
            }
            if let EntryPlan::TwoLimits { primary, secondary } = plan.entry {
                if secondary <= primary {
                    return Err(format!("{}: secondary must rest above primary", case));
                }
            }
            if let Some(dynamic) = plan.dynamic_take_profit {
                if !plan.entry.has_secondary() {
                    return Err(format!("{}: dynamic_take_profit requires a secondary entry", case));
                }
                if dynamic >= plan.stop_loss {
                    return Err(format!("{}: dynamic_take_profit must be below stop_loss", case));
                }
            }
            if let Some(cancel) = plan.cancel_below {
                if entries.iter().any(|r| cancel >= *r) {
                    return Err(format!("{}: cancel_below must be below every entry", case));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::levels::LevelSet;
    use approx::assert_relative_eq;

    #[test]
    fn test_classify_zones() {
        let table = CaseTable::default();
        assert_eq!(table.classify(0.10), None);
        assert_eq!(table.classify(0.499), None);
        assert_eq!(table.classify(0.55), Some(Case::Case1));
        assert_eq!(table.classify(0.70), Some(Case::Case2));
        assert_eq!(table.classify(0.90), Some(Case::Case3));
        assert_eq!(table.classify(1.30), Some(Case::Case4));
    }

    #[test]
    fn test_boundaries_belong_to_higher_case() {
        let table = CaseTable::default();
        assert_eq!(table.classify(0.50), Some(Case::Case1));
        assert_eq!(table.classify(0.618), Some(Case::Case2));
        assert_eq!(table.classify(0.786), Some(Case::Case3));
        assert_eq!(table.classify(1.00), Some(Case::Case4));
    }

    #[test]
    fn test_max_ratio_invalidates() {
        let table = CaseTable {
            max_ratio: Some(1.2),
            ..CaseTable::default()
        };
        assert_eq!(table.classify(1.1), Some(Case::Case4));
        assert_eq!(table.classify(1.2), None);
        assert_eq!(table.classify(f64::NAN), None);
    }

    #[test]
    fn test_resolve_case_1() {
        let levels = LevelSet::from_range(200.0, 100.0, &[]);
        let plan = CaseTable::default().case_1.resolve(&levels);
        assert_relative_eq!(plan.primary_price.unwrap(), 161.8, epsilon = 1e-9);
        assert_relative_eq!(plan.secondary_price.unwrap(), 178.6, epsilon = 1e-9);
        assert_relative_eq!(plan.take_profit, 145.0, epsilon = 1e-9);
        assert_relative_eq!(plan.dynamic_take_profit.unwrap(), 150.0, epsilon = 1e-9);
        assert_relative_eq!(plan.stop_loss, 200.0, epsilon = 1e-9);
        assert_relative_eq!(plan.cancel_below.unwrap(), 120.0, epsilon = 1e-9);
    }

    #[test]
    fn test_resolve_case_4_is_market() {
        let levels = LevelSet::from_range(200.0, 100.0, &[]);
        let plan = CaseTable::default().case_4.resolve(&levels);
        assert_eq!(plan.primary_price, None);
        assert_eq!(plan.secondary_price, None);
        assert_relative_eq!(plan.take_profit, 160.0, epsilon = 1e-9);
        assert_relative_eq!(plan.stop_loss, 205.0, epsilon = 1e-9);
    }

    #[test]
    fn test_default_table_is_valid() {
        assert!(CaseTable::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unordered_boundaries() {
        let mut table = CaseTable::default();
        table.boundaries.case_2 = 0.45;
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_entry_above_stop() {
        let mut table = CaseTable::default();
        table.case_3.stop_loss = 0.7;
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_plan_serde_shape() {
        let json = r#"{
            "entry": {"type": "two_limits", "primary": 0.618, "secondary": 0.786},
            "take_profit": 0.45,
            "dynamic_take_profit": 0.5,
            "stop_loss": 1.0
        }"#;
        let plan: CasePlan = serde_json::from_str(json).unwrap();
        assert!(plan.entry.has_secondary());
        assert_eq!(plan.entry.order_count(), 2);
        assert_eq!(plan.cancel_below, None);
    }
}
