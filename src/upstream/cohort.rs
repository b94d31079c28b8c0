//! Cohort discovery GraphQL wire types.
//!
//! The discovery endpoint groups wallets into size- and PnL-based
//! cohorts. One `GetSizeCohort` query returns a page of traders plus a
//! `hasMore` flag for pagination.

use serde::{Deserialize, Serialize};

/// GraphQL query for a cohort page.
pub const COHORT_QUERY: &str = r#"
query GetSizeCohort($id: String!, $limit: Int!, $offset: Int!, $sortBy: CohortTraderSortInput) {
  analytics {
    sizeCohort(id: $id) {
      topTraders(limit: $limit, offset: $offset, sortBy: $sortBy) {
        totalCount
        hasMore
        traders {
          address
          accountValue
          totalNotional
          longNotional
          shortNotional
        }
      }
    }
  }
}
"#;

/// Request body for a cohort page.
#[derive(Debug, Serialize)]
pub struct CohortRequest {
    pub query: &'static str,
    pub variables: CohortVariables,
    #[serde(rename = "operationName")]
    pub operation_name: &'static str,
}

#[derive(Debug, Serialize)]
pub struct CohortVariables {
    pub id: String,
    pub limit: u32,
    pub offset: u32,
    #[serde(rename = "sortBy")]
    pub sort_by: serde_json::Value,
}

impl CohortRequest {
    pub fn new(cohort_id: &str, offset: u32, limit: u32) -> Self {
        Self {
            query: COHORT_QUERY,
            variables: CohortVariables {
                id: cohort_id.to_string(),
                limit,
                offset,
                sort_by: serde_json::json!({"field": "accountValue", "order": "desc"}),
            },
            operation_name: "GetSizeCohort",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CohortResponse {
    pub data: Option<CohortData>,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct CohortData {
    pub analytics: CohortAnalytics,
}

#[derive(Debug, Deserialize)]
pub struct CohortAnalytics {
    #[serde(rename = "sizeCohort")]
    pub size_cohort: Option<SizeCohort>,
}

#[derive(Debug, Deserialize)]
pub struct SizeCohort {
    #[serde(rename = "topTraders")]
    pub top_traders: TopTraders,
}

#[derive(Debug, Deserialize)]
pub struct TopTraders {
    #[serde(rename = "hasMore", default)]
    pub has_more: bool,
    #[serde(default)]
    pub traders: Vec<CohortTrader>,
}

/// One trader row from a cohort page.
#[derive(Debug, Clone, Deserialize)]
pub struct CohortTrader {
    pub address: String,
    #[serde(rename = "accountValue", default)]
    pub account_value: f64,
    #[serde(rename = "totalNotional", default)]
    pub total_notional: f64,
    #[serde(rename = "longNotional", default)]
    pub long_notional: f64,
    #[serde(rename = "shortNotional", default)]
    pub short_notional: f64,
}

impl CohortTrader {
    /// Effective account leverage; zero equity reads as zero leverage.
    pub fn leverage(&self) -> f64 {
        if self.account_value > 0.0 {
            self.total_notional / self.account_value
        } else {
            0.0
        }
    }

    /// Whether the wallet's directional exposure is long-only. Such
    /// wallets at leverage <= 1 carry no liquidation risk.
    pub fn is_pure_long(&self) -> bool {
        self.long_notional > 0.0 && self.short_notional <= 0.0
    }
}

/// One page of cohort results.
#[derive(Debug)]
pub struct CohortPage {
    pub traders: Vec<CohortTrader>,
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cohort_response_parse() {
        let json = r#"{
            "data": {"analytics": {"sizeCohort": {"topTraders": {
                "totalCount": 2,
                "hasMore": true,
                "traders": [
                    {"address": "0xAA", "accountValue": 1000000.0,
                     "totalNotional": 5000000.0, "longNotional": 5000000.0, "shortNotional": 0.0},
                    {"address": "0xBB", "accountValue": 400000.0,
                     "totalNotional": 350000.0, "longNotional": 100000.0, "shortNotional": 250000.0}
                ]
            }}}}
        }"#;

        let resp: CohortResponse = serde_json::from_str(json).unwrap();
        let traders = resp
            .data
            .unwrap()
            .analytics
            .size_cohort
            .unwrap()
            .top_traders;

        assert!(traders.has_more);
        assert_eq!(traders.traders.len(), 2);

        let whale = &traders.traders[0];
        assert_eq!(whale.leverage(), 5.0);
        assert!(whale.is_pure_long());

        let mixed = &traders.traders[1];
        assert!(!mixed.is_pure_long());
        assert!(mixed.leverage() < 1.0);
    }

    #[test]
    fn test_request_shape() {
        let req = CohortRequest::new("whale", 500, 500);
        let body = serde_json::to_value(&req).unwrap();
        assert_eq!(body["operationName"], "GetSizeCohort");
        assert_eq!(body["variables"]["id"], "whale");
        assert_eq!(body["variables"]["offset"], 500);
    }
}
