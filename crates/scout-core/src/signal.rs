use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::time::{age_hours, parse_iso8601};

/// Coarse grouping of signal kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    Funding,
    IntentAction,
    Engagement,
    CompetitorActivity,
}

/// Every signal kind the embedder has a lookup row for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    FundingRound,
    RoleChange,
    JobPosting,
    NewsMention,
    ContentEngagement,
    ProfileVisit,
    TopicInteraction,
    CompetitorEngagement,
    EventAttendance,
    GroupJoin,
    SocialConnection,
    DemoRequest,
    PricingPageVisit,
}

impl SignalKind {
    pub const ALL: [SignalKind; 13] = [
        SignalKind::FundingRound,
        SignalKind::RoleChange,
        SignalKind::JobPosting,
        SignalKind::NewsMention,
        SignalKind::ContentEngagement,
        SignalKind::ProfileVisit,
        SignalKind::TopicInteraction,
        SignalKind::CompetitorEngagement,
        SignalKind::EventAttendance,
        SignalKind::GroupJoin,
        SignalKind::SocialConnection,
        SignalKind::DemoRequest,
        SignalKind::PricingPageVisit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::FundingRound => "funding_round",
            SignalKind::RoleChange => "role_change",
            SignalKind::JobPosting => "job_posting",
            SignalKind::NewsMention => "news_mention",
            SignalKind::ContentEngagement => "content_engagement",
            SignalKind::ProfileVisit => "profile_visit",
            SignalKind::TopicInteraction => "topic_interaction",
            SignalKind::CompetitorEngagement => "competitor_engagement",
            SignalKind::EventAttendance => "event_attendance",
            SignalKind::GroupJoin => "group_join",
            SignalKind::SocialConnection => "social_connection",
            SignalKind::DemoRequest => "demo_request",
            SignalKind::PricingPageVisit => "pricing_page_visit",
        }
    }

    pub fn category(self) -> SignalCategory {
        match self {
            SignalKind::FundingRound | SignalKind::RoleChange | SignalKind::JobPosting | SignalKind::NewsMention => {
                SignalCategory::Funding
            }
            SignalKind::DemoRequest | SignalKind::PricingPageVisit | SignalKind::ProfileVisit => {
                SignalCategory::IntentAction
            }
            SignalKind::ContentEngagement
            | SignalKind::TopicInteraction
            | SignalKind::EventAttendance
            | SignalKind::GroupJoin
            | SignalKind::SocialConnection => SignalCategory::Engagement,
            SignalKind::CompetitorEngagement => SignalCategory::CompetitorActivity,
        }
    }

    /// Position in `ALL`, used as the embedding-table offset.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses `funding_round`, `FUNDING_ROUND` and `SIGNAL_FUNDING_ROUND` alike.
/// Anything else fails closed with `UnknownFeatureKind`.
impl FromStr for SignalKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let name = lower.strip_prefix("signal_").unwrap_or(&lower);
        SignalKind::ALL
            .into_iter()
            .find(|k| k.as_str() == name)
            .ok_or_else(|| CoreError::UnknownFeatureKind(s.to_string()))
    }
}

/// Stabilizing transform applied to a numeric feature before projection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureTransform {
    /// `ln(1 + max(x, 0))`, for counts and monetary amounts.
    Log1p,
    /// Clamp to `[0, 1]`, for strengths, ratios and scores.
    Clamp01,
}

impl FeatureTransform {
    pub fn apply(self, x: f64) -> f64 {
        if !x.is_finite() {
            return 0.0;
        }
        match self {
            FeatureTransform::Log1p => x.max(0.0).ln_1p(),
            FeatureTransform::Clamp01 => x.clamp(0.0, 1.0),
        }
    }
}

impl fmt::Display for FeatureTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureTransform::Log1p => f.write_str("log1p"),
            FeatureTransform::Clamp01 => f.write_str("clamp01"),
        }
    }
}

/// Named numeric payload fields. The transform for each is fixed here so
/// training and inference apply the identical function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericFeature {
    Strength,
    FundingAmount,
    MonthsInRole,
    PageViews,
    EmployeeCount,
    SurgeRatio,
    MatchScore,
}

impl NumericFeature {
    pub const ALL: [NumericFeature; 7] = [
        NumericFeature::Strength,
        NumericFeature::FundingAmount,
        NumericFeature::MonthsInRole,
        NumericFeature::PageViews,
        NumericFeature::EmployeeCount,
        NumericFeature::SurgeRatio,
        NumericFeature::MatchScore,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NumericFeature::Strength => "strength",
            NumericFeature::FundingAmount => "funding_amount",
            NumericFeature::MonthsInRole => "months_in_role",
            NumericFeature::PageViews => "page_views",
            NumericFeature::EmployeeCount => "employee_count",
            NumericFeature::SurgeRatio => "surge_ratio",
            NumericFeature::MatchScore => "match_score",
        }
    }

    pub fn transform(self) -> FeatureTransform {
        match self {
            NumericFeature::FundingAmount
            | NumericFeature::MonthsInRole
            | NumericFeature::PageViews
            | NumericFeature::EmployeeCount => FeatureTransform::Log1p,
            NumericFeature::Strength | NumericFeature::SurgeRatio | NumericFeature::MatchScore => {
                FeatureTransform::Clamp01
            }
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// The code's transform table, recorded into snapshots at training time.
    pub fn transform_table() -> BTreeMap<NumericFeature, FeatureTransform> {
        NumericFeature::ALL.into_iter().map(|f| (f, f.transform())).collect()
    }
}

impl FromStr for NumericFeature {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        NumericFeature::ALL
            .into_iter()
            .find(|f| f.as_str() == name)
            .ok_or_else(|| CoreError::UnknownFeatureKind(s.to_string()))
    }
}

/// Signal as delivered by the ingestion collaborator, before validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawSignal {
    pub kind: String,
    pub timestamp: String,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
}

fn default_strength() -> f64 {
    0.5
}

/// One observed, validated event about a lead. Immutable once built.
///
/// Deserialization runs the same checks as `new` and `from_raw`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireSignalRecord", into = "WireSignalRecord")]
pub struct SignalRecord {
    pub kind: SignalKind,
    /// Unix seconds (UTC).
    pub timestamp: i64,
    pub strength: f64,
    pub features: BTreeMap<NumericFeature, f64>,
}

#[derive(Serialize, Deserialize)]
struct WireSignalRecord {
    kind: SignalKind,
    timestamp: i64,
    strength: f64,
    #[serde(default)]
    features: BTreeMap<NumericFeature, f64>,
}

impl TryFrom<WireSignalRecord> for SignalRecord {
    type Error = CoreError;

    fn try_from(w: WireSignalRecord) -> Result<Self> {
        let mut record = SignalRecord::new(w.kind, w.timestamp, w.strength)?;
        for (feature, value) in w.features {
            check_feature_value(feature.as_str(), value)?;
            record.features.insert(feature, value);
        }
        Ok(record)
    }
}

impl From<SignalRecord> for WireSignalRecord {
    fn from(r: SignalRecord) -> Self {
        WireSignalRecord {
            kind: r.kind,
            timestamp: r.timestamp,
            strength: r.strength,
            features: r.features,
        }
    }
}

fn check_feature_value(name: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(CoreError::InvalidValue {
            field: name.to_string(),
            value,
        })
    }
}

impl SignalRecord {
    pub fn new(kind: SignalKind, timestamp: i64, strength: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&strength) {
            return Err(CoreError::InvalidValue {
                field: "strength".to_string(),
                value: strength,
            });
        }
        Ok(Self {
            kind,
            timestamp,
            strength,
            features: BTreeMap::new(),
        })
    }

    pub fn with_feature(mut self, feature: NumericFeature, value: f64) -> Self {
        self.features.insert(feature, value);
        self
    }

    /// Validate a raw ingestion record. Unknown kinds and feature names fail
    /// closed; nothing is silently dropped or zero-filled.
    pub fn from_raw(raw: &RawSignal) -> Result<Self> {
        let kind: SignalKind = raw.kind.parse()?;
        let timestamp = parse_iso8601(&raw.timestamp)?;
        let mut record = SignalRecord::new(kind, timestamp, raw.strength)?;
        for (name, &value) in &raw.features {
            let feature: NumericFeature = name.parse()?;
            check_feature_value(name, value)?;
            record.features.insert(feature, value);
        }
        Ok(record)
    }

    /// Age in hours relative to `reference` (Unix seconds), never negative.
    pub fn age_hours(&self, reference: i64) -> f64 {
        age_hours(self.timestamp, reference)
    }
}
