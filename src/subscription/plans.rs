//! Plan catalog reference data and effective-plan resolution types.

use crate::store::PlanRecord;

pub const PLAN_FREE: &str = "free";
pub const PLAN_PROFESSIONAL: &str = "professional";
pub const PLAN_ENTERPRISE: &str = "enterprise";

/// The seeded tiers. `free` is the base plan every fallback lands on,
/// `professional` is the trial tier, `enterprise` bypasses every dimension.
#[must_use]
pub fn default_catalog() -> Vec<PlanRecord> {
    vec![
        PlanRecord {
            code: PLAN_FREE.to_string(),
            name: "Free".to_string(),
            max_domains: Some(10),
            max_team_members: Some(3),
            check_interval_seconds: 300,
            api_requests_per_month: Some(10_000),
            sms_per_month: None,
            email_alerts: true,
            sms_alerts: false,
            slack_alerts: false,
            unlimited: false,
        },
        PlanRecord {
            code: PLAN_PROFESSIONAL.to_string(),
            name: "Professional".to_string(),
            max_domains: Some(50),
            max_team_members: Some(10),
            check_interval_seconds: 60,
            api_requests_per_month: Some(100_000),
            sms_per_month: Some(100),
            email_alerts: true,
            sms_alerts: true,
            slack_alerts: true,
            unlimited: false,
        },
        PlanRecord {
            code: PLAN_ENTERPRISE.to_string(),
            name: "Enterprise".to_string(),
            max_domains: None,
            max_team_members: None,
            check_interval_seconds: 30,
            api_requests_per_month: None,
            sms_per_month: None,
            email_alerts: true,
            sms_alerts: true,
            slack_alerts: true,
            unlimited: true,
        },
    ]
}

/// Where the effective limits came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    /// The plan's own limits apply.
    Base,
    /// An active trial caps domains and SMS at fixed reduced values while the
    /// plan's feature flags stay in force.
    TrialOverride { domain_cap: i64, sms_cap: i64 },
}

/// Monthly-metered dimensions distinguish "no cap" from "not entitled":
/// a plan without an SMS allowance has the feature off, not open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthlyLimit {
    Unlimited,
    NotEntitled,
    Capped(i64),
}

/// The plan limits actually applicable to an identity right now, after trial
/// override and expiry resolution. Every caller goes through this type, so
/// override logic lives in one exhaustive place.
#[derive(Debug, Clone)]
pub struct EffectivePlan {
    pub plan: PlanRecord,
    pub source: PlanSource,
}

impl EffectivePlan {
    #[must_use]
    pub fn unlimited(&self) -> bool {
        self.plan.unlimited
    }

    /// `None` means uncapped.
    #[must_use]
    pub fn domain_limit(&self) -> Option<i64> {
        if self.plan.unlimited {
            return None;
        }
        match self.source {
            PlanSource::Base => self.plan.max_domains,
            PlanSource::TrialOverride { domain_cap, .. } => Some(domain_cap),
        }
    }

    /// `None` means uncapped. Team size has no trial override.
    #[must_use]
    pub fn team_limit(&self) -> Option<i64> {
        if self.plan.unlimited {
            return None;
        }
        self.plan.max_team_members
    }

    #[must_use]
    pub fn sms_limit(&self) -> MonthlyLimit {
        if self.plan.unlimited {
            return MonthlyLimit::Unlimited;
        }
        match self.source {
            PlanSource::TrialOverride { sms_cap, .. } => MonthlyLimit::Capped(sms_cap),
            PlanSource::Base => match self.plan.sms_per_month {
                None | Some(0) => MonthlyLimit::NotEntitled,
                Some(limit) => MonthlyLimit::Capped(limit),
            },
        }
    }

    /// API requests have no trial override.
    #[must_use]
    pub fn api_limit(&self) -> MonthlyLimit {
        if self.plan.unlimited {
            return MonthlyLimit::Unlimited;
        }
        match self.plan.api_requests_per_month {
            None | Some(0) => MonthlyLimit::NotEntitled,
            Some(limit) => MonthlyLimit::Capped(limit),
        }
    }

    /// Feature flags are the underlying plan's values; the unlimited tier has
    /// everything.
    #[must_use]
    pub fn email_alerts(&self) -> bool {
        self.plan.email_alerts || self.plan.unlimited
    }

    #[must_use]
    pub fn sms_alerts(&self) -> bool {
        self.plan.sms_alerts || self.plan.unlimited
    }

    #[must_use]
    pub fn slack_alerts(&self) -> bool {
        self.plan.slack_alerts || self.plan.unlimited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(code: &str) -> PlanRecord {
        default_catalog()
            .into_iter()
            .find(|plan| plan.code == code)
            .expect("catalog plan")
    }

    #[test]
    fn catalog_has_the_three_tiers() {
        let codes: Vec<String> = default_catalog().into_iter().map(|plan| plan.code).collect();
        assert_eq!(codes, vec![PLAN_FREE, PLAN_PROFESSIONAL, PLAN_ENTERPRISE]);
    }

    #[test]
    fn base_plan_limits_apply_without_override() {
        let effective = EffectivePlan {
            plan: plan(PLAN_FREE),
            source: PlanSource::Base,
        };
        assert_eq!(effective.domain_limit(), Some(10));
        assert_eq!(effective.team_limit(), Some(3));
        assert_eq!(effective.sms_limit(), MonthlyLimit::NotEntitled);
        assert_eq!(effective.api_limit(), MonthlyLimit::Capped(10_000));
        assert!(!effective.slack_alerts());
    }

    #[test]
    fn trial_override_caps_domains_and_sms_only() {
        let effective = EffectivePlan {
            plan: plan(PLAN_PROFESSIONAL),
            source: PlanSource::TrialOverride {
                domain_cap: 10,
                sms_cap: 10,
            },
        };
        assert_eq!(effective.domain_limit(), Some(10));
        assert_eq!(effective.team_limit(), Some(10));
        assert_eq!(effective.sms_limit(), MonthlyLimit::Capped(10));
        assert_eq!(effective.api_limit(), MonthlyLimit::Capped(100_000));
        // Full feature set of the trial tier stays on.
        assert!(effective.slack_alerts());
        assert!(effective.sms_alerts());
    }

    #[test]
    fn unlimited_tier_bypasses_every_dimension() {
        let effective = EffectivePlan {
            plan: plan(PLAN_ENTERPRISE),
            source: PlanSource::Base,
        };
        assert_eq!(effective.domain_limit(), None);
        assert_eq!(effective.team_limit(), None);
        assert_eq!(effective.sms_limit(), MonthlyLimit::Unlimited);
        assert_eq!(effective.api_limit(), MonthlyLimit::Unlimited);
        assert!(effective.slack_alerts());
    }

    #[test]
    fn zero_monthly_limit_means_not_entitled() {
        let mut record = plan(PLAN_PROFESSIONAL);
        record.sms_per_month = Some(0);
        let effective = EffectivePlan {
            plan: record,
            source: PlanSource::Base,
        };
        assert_eq!(effective.sms_limit(), MonthlyLimit::NotEntitled);
    }
}
