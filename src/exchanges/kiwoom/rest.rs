use crate::core::errors::KiwoomError;
use crate::core::kernel::{
    concat_records, request_until, RestClient, RestRequest, RestResponse, DEFAULT_MAX_PAGES,
};
use crate::exchanges::kiwoom::types::{
    ChartPeriod, ChartSpec, ChartTarget, Market, StockInfo, StockListResponse,
};
use chrono::{FixedOffset, NaiveDate, Utc};
use serde_json::{json, Value};
use tracing::{debug, instrument};

pub const STOCK_INFO_ENDPOINT: &str = "/api/dostk/stkinfo";
pub const STOCK_LIST_API_ID: &str = "ka10099";
pub const CHART_ENDPOINT: &str = "/api/dostk/chart";

/// Thin typed wrapper around `RestClient` for the venue's queries
pub struct KiwoomRestClient<R: RestClient> {
    client: R,
}

impl<R: RestClient> KiwoomRestClient<R> {
    pub fn new(client: R) -> Self {
        Self { client }
    }

    pub fn inner(&self) -> &R {
        &self.client
    }

    /// Send one request
    pub async fn send(&self, request: &RestRequest) -> Result<RestResponse, KiwoomError> {
        self.client.send(request).await
    }

    /// Page through a query while the server has more and `should_continue`
    /// accepts the latest body
    pub async fn request_until<F>(
        &self,
        request: &RestRequest,
        max_pages: usize,
        should_continue: F,
    ) -> Result<Vec<RestResponse>, KiwoomError>
    where
        F: FnMut(&Value) -> bool + Send,
    {
        request_until(&self.client, request, max_pages, should_continue).await
    }

    /// Follow a query to exhaustion and concatenate the array under `key`
    pub async fn fetch_all(
        &self,
        request: &RestRequest,
        key: &str,
    ) -> Result<Vec<Value>, KiwoomError> {
        let pages = request_until(&self.client, request, DEFAULT_MAX_PAGES, |_| true).await?;
        Ok(concat_records(&pages, key))
    }

    /// Instruments listed on a market
    ///
    /// A composite market is assembled from its component lists, keeping the
    /// instruments that also trade on the alternative exchange, ordered by code.
    #[instrument(skip(self), fields(market = %market))]
    pub async fn stock_list(&self, market: Market) -> Result<Vec<StockInfo>, KiwoomError> {
        let components = market.components();
        if components.is_empty() {
            return self.market_list(market).await;
        }

        let mut list = Vec::new();
        for component in components {
            list.extend(self.market_list(*component).await?);
        }
        list.retain(StockInfo::is_nxt_enabled);
        list.sort_by(|a, b| a.code.cmp(&b.code));
        debug!(count = list.len(), "assembled composite market");
        Ok(list)
    }

    async fn market_list(&self, market: Market) -> Result<Vec<StockInfo>, KiwoomError> {
        let request = RestRequest::post(STOCK_INFO_ENDPOINT, STOCK_LIST_API_ID)
            .with_body(json!({ "mrkt_tp": market.code() }));
        let response: StockListResponse = self.client.send_json(&request).await?;

        if response.list.len() <= 1 {
            return Err(KiwoomError::InvalidParameters(format!(
                "Stock list is not available for market code {}",
                market
            )));
        }
        Ok(response.list)
    }

    /// Instrument codes of a market, optionally in their cross-exchange form
    ///
    /// `Market::Nxt` always yields cross-exchange codes: its instruments are
    /// only addressable on the alternative exchange through them.
    pub async fn stock_codes(
        &self,
        market: Market,
        integrated: bool,
    ) -> Result<Vec<String>, KiwoomError> {
        let list = self.stock_list(market).await?;
        if market == Market::Nxt {
            let mut codes: Vec<String> = list
                .iter()
                .map(StockInfo::integrated_code)
                .filter(|code| code.contains("AL"))
                .collect();
            codes.sort();
            return Ok(codes);
        }

        Ok(list
            .iter()
            .map(|info| {
                if integrated {
                    info.integrated_code()
                } else {
                    info.code.clone()
                }
            })
            .collect())
    }

    /// Chart bars of a stock or sector, newest first
    ///
    /// Pages are followed while the earliest bar of the latest page is not
    /// older than `start` (`YYYYMMDD`); without `start` the query runs until
    /// the venue has no more pages. The last page may reach past `start`.
    /// `end` sets the base date of daily charts and defaults to today in
    /// Korea Standard Time; intraday charts always start from the latest bar.
    #[instrument(skip(self), fields(period = %period, target = %target))]
    pub async fn candle(
        &self,
        code: &str,
        period: ChartPeriod,
        target: ChartTarget,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<Value>, KiwoomError> {
        for date in start.iter().chain(end.iter()) {
            NaiveDate::parse_from_str(date, "%Y%m%d").map_err(|e| {
                KiwoomError::InvalidParameters(format!("Invalid chart date '{}': {}", date, e))
            })?;
        }

        let spec = ChartSpec::of(target, period);
        let mut body = json!({});
        body[target.code_field()] = json!(code);
        match period {
            ChartPeriod::Tick | ChartPeriod::Minute => {
                body["tic_scope"] = json!("1");
            }
            ChartPeriod::Day => {
                let base_dt = match end {
                    Some(end) => end.to_string(),
                    None => today_kst()?,
                };
                body["base_dt"] = json!(base_dt);
            }
        }
        if target == ChartTarget::Stock {
            body["upd_stkpc_tp"] = json!("1");
        }

        let request = RestRequest::post(CHART_ENDPOINT, spec.api_id).with_body(body);
        let time_key = period.time_key();
        let pages = request_until(&self.client, &request, DEFAULT_MAX_PAGES, |page| {
            reaches_start(page, spec.records_key, time_key, start)
        })
        .await?;

        let records = concat_records(&pages, spec.records_key);
        debug!(pages = pages.len(), records = records.len(), "chart fetched");
        Ok(records)
    }
}

/// Whether a chart page leaves bars between `start` and its earliest bar
fn reaches_start(page: &Value, records_key: &str, time_key: &str, start: Option<&str>) -> bool {
    let Some(records) = page
        .get(records_key)
        .and_then(Value::as_array)
        .filter(|records| !records.is_empty())
    else {
        return false;
    };
    let Some(start) = start else {
        return true;
    };

    records
        .last()
        .and_then(|record| record.get(time_key))
        .and_then(Value::as_str)
        .and_then(|time| time.get(..8))
        .is_some_and(|earliest| start <= earliest)
}

fn today_kst() -> Result<String, KiwoomError> {
    let kst = FixedOffset::east_opt(9 * 3600)
        .ok_or_else(|| KiwoomError::InvalidParameters("Invalid KST offset".to_string()))?;
    Ok(Utc::now().with_timezone(&kst).format("%Y%m%d").to_string())
}
