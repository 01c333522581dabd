use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize)]
pub struct TokenRequest<'a> {
    pub grant_type: &'a str,
    pub appkey: &'a str,
    pub secretkey: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    /// `YYYYMMDDHHMMSS`, Korea Standard Time
    #[serde(default)]
    pub expires_dt: Option<String>,
    #[serde(default)]
    pub return_code: i64,
    #[serde(default)]
    pub return_msg: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RevokeRequest<'a> {
    pub appkey: &'a str,
    pub secretkey: &'a str,
    pub token: &'a str,
}

/// Market selector of the stock list query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Market {
    Kospi,
    Kosdaq,
    Elw,
    MutualFund,
    Warrant,
    Reits,
    Etf,
    HighYieldFund,
    KOtc,
    Konex,
    Etn,
    /// Instruments of KOSPI and KOSDAQ that also trade on the alternative
    /// exchange; assembled from both lists rather than queried directly
    Nxt,
}

impl Market {
    /// Venue code sent as `mrkt_tp`
    pub fn code(self) -> &'static str {
        match self {
            Self::Kospi => "0",
            Self::Kosdaq => "10",
            Self::Elw => "3",
            Self::MutualFund => "4",
            Self::Warrant => "5",
            Self::Reits => "6",
            Self::Etf => "8",
            Self::HighYieldFund => "9",
            Self::KOtc => "30",
            Self::Konex => "50",
            Self::Etn => "60",
            Self::Nxt => "NXT",
        }
    }

    /// Markets whose lists make up a composite market, empty for markets the
    /// venue answers directly
    pub fn components(self) -> &'static [Market] {
        match self {
            Self::Nxt => &[Self::Kospi, Self::Kosdaq],
            _ => &[],
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StockInfo {
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub market_code: Option<String>,
    #[serde(default)]
    pub market_name: Option<String>,
    #[serde(default)]
    pub last_price: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub nxt_enable: Option<String>,
}

impl StockInfo {
    /// Whether the instrument also trades on the alternative exchange
    pub fn is_nxt_enabled(&self) -> bool {
        self.nxt_enable
            .as_deref()
            .is_some_and(|flag| flag.eq_ignore_ascii_case("Y"))
    }

    /// Code addressing the instrument across both exchanges when it is
    /// listed on the alternative one
    pub fn integrated_code(&self) -> String {
        if self.is_nxt_enabled() {
            format!("{}_AL", self.code)
        } else {
            self.code.clone()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StockListResponse {
    #[serde(default)]
    pub list: Vec<StockInfo>,
}

/// Bar interval of a chart query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChartPeriod {
    Tick,
    Minute,
    Day,
}

impl ChartPeriod {
    /// Field holding the bar timestamp, `YYYYMMDD` prefixed
    pub fn time_key(self) -> &'static str {
        match self {
            Self::Tick | Self::Minute => "cntr_tm",
            Self::Day => "dt",
        }
    }
}

impl fmt::Display for ChartPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tick => "tick",
            Self::Minute => "min",
            Self::Day => "day",
        })
    }
}

/// Kind of instrument a chart query addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChartTarget {
    Stock,
    Sector,
}

impl ChartTarget {
    /// Body field carrying the instrument code
    pub fn code_field(self) -> &'static str {
        match self {
            Self::Stock => "stk_cd",
            Self::Sector => "inds_cd",
        }
    }
}

impl fmt::Display for ChartTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stock => "stock",
            Self::Sector => "sector",
        })
    }
}

/// Venue routing of one chart query: api-id and the array key of the reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChartSpec {
    pub api_id: &'static str,
    pub records_key: &'static str,
}

impl ChartSpec {
    pub fn of(target: ChartTarget, period: ChartPeriod) -> Self {
        let (api_id, records_key) = match (target, period) {
            (ChartTarget::Stock, ChartPeriod::Tick) => ("ka10079", "stk_tic_chart_qry"),
            (ChartTarget::Stock, ChartPeriod::Minute) => ("ka10080", "stk_min_pole_chart_qry"),
            (ChartTarget::Stock, ChartPeriod::Day) => ("ka10081", "stk_dt_pole_chart_qry"),
            (ChartTarget::Sector, ChartPeriod::Tick) => ("ka20004", "inds_tic_chart_qry"),
            (ChartTarget::Sector, ChartPeriod::Minute) => ("ka20005", "inds_min_pole_qry"),
            (ChartTarget::Sector, ChartPeriod::Day) => ("ka20006", "inds_dt_pole_qry"),
        };
        Self {
            api_id,
            records_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_info_parsing() {
        let response: StockListResponse = serde_json::from_str(
            r#"{"return_code":0,"list":[
                {"code":"005930","name":"삼성전자","marketCode":"0","nxtEnable":"Y","unknown":1},
                {"code":"000020","name":"동화약품","nxtEnable":"N"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(response.list.len(), 2);
        assert_eq!(response.list[0].integrated_code(), "005930_AL");
        assert_eq!(response.list[1].integrated_code(), "000020");
        assert_eq!(response.list[0].market_code.as_deref(), Some("0"));
    }

    #[test]
    fn test_market_codes() {
        assert_eq!(Market::Kospi.code(), "0");
        assert_eq!(Market::Kosdaq.to_string(), "10");
        assert_eq!(Market::Nxt.components(), &[Market::Kospi, Market::Kosdaq]);
        assert!(Market::Etf.components().is_empty());
    }

    #[test]
    fn test_chart_routing() {
        let spec = ChartSpec::of(ChartTarget::Stock, ChartPeriod::Day);
        assert_eq!(spec.api_id, "ka10081");
        assert_eq!(spec.records_key, "stk_dt_pole_chart_qry");
        assert_eq!(ChartSpec::of(ChartTarget::Sector, ChartPeriod::Minute).api_id, "ka20005");
        assert_eq!(ChartPeriod::Tick.time_key(), "cntr_tm");
        assert_eq!(ChartTarget::Sector.code_field(), "inds_cd");
    }
}
