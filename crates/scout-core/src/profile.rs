//! Lead-profile bucketing: static firmographic facts become categorical
//! tokens that sit at the head of a scoring sequence.

use serde::{Deserialize, Serialize};

use crate::constants::SURGE_EPSILON;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadProfile {
    pub months_in_role: f64,
    pub funding_amount: f64,
    pub own_views_1m: f64,
    pub own_views_3m: f64,
    pub comp_views_1m: f64,
    pub comp_views_3m: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProfileToken {
    TenureNew,
    TenureShort,
    TenureMid,
    TenureLong,
    FundingBootstrap,
    FundingSeed,
    FundingSeriesA,
    FundingGrowth,
    MomentumDeclining,
    MomentumStable,
    MomentumAccelerating,
    CompLow,
    CompMed,
    CompHigh,
}

impl ProfileToken {
    pub const COUNT: usize = 14;

    pub fn index(self) -> usize {
        self as usize
    }
}

impl LeadProfile {
    /// Page-view surge: last month against the trailing three-month average.
    pub fn surge_ratio(&self) -> f64 {
        self.own_views_1m / (self.own_views_3m / 3.0 + SURGE_EPSILON)
    }

    pub fn competitive_intensity(&self) -> f64 {
        self.comp_views_1m + self.comp_views_3m
    }

    /// Tenure, funding, momentum and competition tokens, in that order.
    pub fn tokens(&self) -> [ProfileToken; 4] {
        let tenure = match self.months_in_role {
            m if m < 3.0 => ProfileToken::TenureNew,
            m if m < 6.0 => ProfileToken::TenureShort,
            m if m < 18.0 => ProfileToken::TenureMid,
            _ => ProfileToken::TenureLong,
        };
        let funding = match self.funding_amount {
            f if f < 100_000.0 => ProfileToken::FundingBootstrap,
            f if f < 1_000_000.0 => ProfileToken::FundingSeed,
            f if f < 10_000_000.0 => ProfileToken::FundingSeriesA,
            _ => ProfileToken::FundingGrowth,
        };
        let momentum = match self.surge_ratio() {
            r if r < 0.8 => ProfileToken::MomentumDeclining,
            r if r < 1.2 => ProfileToken::MomentumStable,
            _ => ProfileToken::MomentumAccelerating,
        };
        let competition = match self.competitive_intensity() {
            c if c < 3.0 => ProfileToken::CompLow,
            c if c < 10.0 => ProfileToken::CompMed,
            _ => ProfileToken::CompHigh,
        };
        [tenure, funding, momentum, competition]
    }
}
