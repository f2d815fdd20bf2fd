//! Policy condition evaluation.
//!
//! A policy carries zero or more [`Condition`]s; access is granted when every
//! condition holds for the connecting client. A policy without conditions is
//! unconditionally authorized.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod time_ranges;

pub use time_ranges::{DayTimeRanges, TimeRangeError};

use chrono::{DateTime, Utc};
use ip_network::IpNetwork;
use portal_model::ProviderId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// A single requirement on the connecting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "property", rename_all = "snake_case")]
pub enum Condition {
    RemoteIpLocationRegion {
        operator: MembershipOperator,
        values: Vec<String>,
    },
    RemoteIp {
        operator: CidrOperator,
        values: Vec<String>,
    },
    ProviderId {
        operator: MembershipOperator,
        values: Vec<String>,
    },
    CurrentUtcDatetime {
        operator: DayOfWeekOperator,
        values: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipOperator {
    IsIn,
    IsNotIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CidrOperator {
    IsInCidr,
    IsNotInCidr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayOfWeekOperator {
    IsInDayOfWeekTimeRanges,
}

/// The property of a failed condition, as reported back to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolatedProperty {
    RemoteIpLocationRegion,
    RemoteIp,
    ProviderId,
    CurrentUtcDatetime,
}

/// The client-side facts conditions are evaluated against.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub remote_ip: IpAddr,
    pub region: Option<String>,
    pub provider_id: Option<ProviderId>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),
    #[error("invalid provider id: {0}")]
    InvalidProviderId(String),
    #[error(transparent)]
    TimeRange(#[from] TimeRangeError),
}

impl Condition {
    /// Checks the condition's values for well-formedness.
    ///
    /// Called when a policy is created or updated so that evaluation never
    /// sees malformed values.
    pub fn validate(&self) -> Result<(), ConditionError> {
        match self {
            Condition::RemoteIpLocationRegion { .. } => Ok(()),
            Condition::RemoteIp { values, .. } => {
                for value in values {
                    value
                        .parse::<IpNetwork>()
                        .map_err(|_| ConditionError::InvalidCidr(value.clone()))?;
                }

                Ok(())
            }
            Condition::ProviderId { values, .. } => {
                for value in values {
                    value
                        .parse::<ProviderId>()
                        .map_err(|_| ConditionError::InvalidProviderId(value.clone()))?;
                }

                Ok(())
            }
            Condition::CurrentUtcDatetime { values, .. } => {
                for value in values {
                    value.parse::<DayTimeRanges>()?;
                }

                Ok(())
            }
        }
    }

    fn holds(&self, eval: &Evaluation) -> bool {
        match self {
            Condition::RemoteIpLocationRegion { operator, values } => {
                let Some(region) = eval.region.as_deref() else {
                    // Without a resolved region we cannot prove membership.
                    return matches!(operator, MembershipOperator::IsNotIn);
                };

                let contained = values.iter().any(|v| v == region);

                match operator {
                    MembershipOperator::IsIn => contained,
                    MembershipOperator::IsNotIn => !contained,
                }
            }
            Condition::RemoteIp { operator, values } => {
                let contained = values
                    .iter()
                    .filter_map(|v| v.parse::<IpNetwork>().ok())
                    .any(|network| network.contains(eval.remote_ip));

                match operator {
                    CidrOperator::IsInCidr => contained,
                    CidrOperator::IsNotInCidr => !contained,
                }
            }
            Condition::ProviderId { operator, values } => {
                let Some(provider_id) = eval.provider_id else {
                    return matches!(operator, MembershipOperator::IsNotIn);
                };

                let contained = values
                    .iter()
                    .filter_map(|v| v.parse::<ProviderId>().ok())
                    .any(|candidate| candidate == provider_id);

                match operator {
                    MembershipOperator::IsIn => contained,
                    MembershipOperator::IsNotIn => !contained,
                }
            }
            Condition::CurrentUtcDatetime { operator, values } => match operator {
                DayOfWeekOperator::IsInDayOfWeekTimeRanges => values
                    .iter()
                    .filter_map(|v| v.parse::<DayTimeRanges>().ok())
                    .any(|ranges| ranges.contains(eval.now)),
            },
        }
    }

    fn property(&self) -> ViolatedProperty {
        match self {
            Condition::RemoteIpLocationRegion { .. } => ViolatedProperty::RemoteIpLocationRegion,
            Condition::RemoteIp { .. } => ViolatedProperty::RemoteIp,
            Condition::ProviderId { .. } => ViolatedProperty::ProviderId,
            Condition::CurrentUtcDatetime { .. } => ViolatedProperty::CurrentUtcDatetime,
        }
    }
}

/// Evaluates the conjunction of all conditions.
///
/// Returns the set of violated properties on failure; an empty condition list
/// always conforms.
pub fn conforms(conditions: &[Condition], eval: &Evaluation) -> Result<(), Vec<ViolatedProperty>> {
    let violated = conditions
        .iter()
        .filter(|condition| !condition.holds(eval))
        .map(Condition::property)
        .collect::<BTreeSet<_>>();

    if violated.is_empty() {
        return Ok(());
    }

    Err(violated.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn eval() -> Evaluation {
        Evaluation {
            remote_ip: "203.0.113.10".parse().unwrap(),
            region: Some("DE".to_owned()),
            provider_id: Some(ProviderId::from_u128(7)),
            now: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(), // A Friday.
        }
    }

    #[test]
    fn no_conditions_is_authorized() {
        assert_eq!(conforms(&[], &eval()), Ok(()));
    }

    #[test]
    fn region_is_in() {
        let condition = Condition::RemoteIpLocationRegion {
            operator: MembershipOperator::IsIn,
            values: vec!["DE".to_owned(), "FR".to_owned()],
        };

        assert_eq!(conforms(&[condition], &eval()), Ok(()));
    }

    #[test]
    fn region_is_not_in_violates_for_member() {
        let condition = Condition::RemoteIpLocationRegion {
            operator: MembershipOperator::IsNotIn,
            values: vec!["DE".to_owned()],
        };

        assert_eq!(
            conforms(&[condition], &eval()),
            Err(vec![ViolatedProperty::RemoteIpLocationRegion])
        );
    }

    #[test]
    fn remote_ip_cidr_mismatched_family_does_not_match() {
        let condition = Condition::RemoteIp {
            operator: CidrOperator::IsInCidr,
            values: vec!["2001:db8::/32".to_owned()],
        };

        assert_eq!(
            conforms(&[condition], &eval()),
            Err(vec![ViolatedProperty::RemoteIp])
        );
    }

    #[test]
    fn remote_ip_in_cidr() {
        let condition = Condition::RemoteIp {
            operator: CidrOperator::IsInCidr,
            values: vec!["203.0.113.0/24".to_owned()],
        };

        assert_eq!(conforms(&[condition], &eval()), Ok(()));
    }

    #[test]
    fn violations_are_deduplicated_and_sorted() {
        let a = Condition::RemoteIp {
            operator: CidrOperator::IsInCidr,
            values: vec!["10.0.0.0/8".to_owned()],
        };
        let b = Condition::RemoteIp {
            operator: CidrOperator::IsNotInCidr,
            values: vec!["203.0.113.0/24".to_owned()],
        };
        let c = Condition::ProviderId {
            operator: MembershipOperator::IsIn,
            values: vec![ProviderId::from_u128(8).to_string()],
        };

        assert_eq!(
            conforms(&[a, b, c], &eval()),
            Err(vec![ViolatedProperty::RemoteIp, ViolatedProperty::ProviderId])
        );
    }

    #[test]
    fn instant_on_range_boundary_is_admitted() {
        let condition = Condition::CurrentUtcDatetime {
            operator: DayOfWeekOperator::IsInDayOfWeekTimeRanges,
            values: vec!["F/10:00:00-10:00:00/UTC".to_owned()],
        };

        assert_eq!(conforms(&[condition], &eval()), Ok(()));
    }

    #[test]
    fn conditions_deserialize_from_policy_json() {
        let json = r#"{
            "property": "remote_ip_location_region",
            "operator": "is_not_in",
            "values": ["US", "CA"]
        }"#;

        let condition = serde_json::from_str::<Condition>(json).unwrap();

        assert_eq!(
            condition,
            Condition::RemoteIpLocationRegion {
                operator: MembershipOperator::IsNotIn,
                values: vec!["US".to_owned(), "CA".to_owned()],
            }
        );
    }
}
