use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use sha2::Sha256;

use super::error::BinanceError;
use super::types::*;
use crate::core::config::BinanceConfig;

type HmacSha256 = Hmac<Sha256>;

/// The exchange wire surface the execution engine consumes. Everything the
/// engine does against Binance goes through this trait so the whole state
/// machine can be driven against a test double.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn fetch_balance_usdt(&self) -> Result<f64, BinanceError>;
    async fn fetch_positions(&self) -> Result<Vec<PositionRisk>, BinanceError>;
    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, BinanceError>;
    async fn fetch_mark_price(&self, symbol: &str) -> Result<f64, BinanceError>;
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, BinanceError>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), BinanceError>;
    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<(), BinanceError>;
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), BinanceError>;
    async fn set_margin_type(&self, symbol: &str, margin_type: &str) -> Result<(), BinanceError>;
    async fn start_user_stream(&self) -> Result<String, BinanceError>;
    async fn keepalive_user_stream(&self, listen_key: &str) -> Result<(), BinanceError>;
}

pub struct BinanceClient {
    client: Client,
    config: BinanceConfig,
}

impl BinanceClient {
    pub fn new(config: BinanceConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.config.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T, BinanceError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        params.push(("recvWindow", "5000".to_string()));
        params.push(("timestamp", timestamp.to_string()));

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);

        let url = format!(
            "{}{}?{}&signature={}",
            self.config.base_url, endpoint, query, signature
        );

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.config.api_key)
            .send()
            .await?;

        self.decode_response(response).await
    }

    /// listenKey endpoints want the API key header but no signature.
    async fn keyed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T, BinanceError> {
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let url = if query.is_empty() {
            format!("{}{}", self.config.base_url, endpoint)
        } else {
            format!("{}{}?{}", self.config.base_url, endpoint, query)
        };

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.config.api_key)
            .send()
            .await?;

        self.decode_response(response).await
    }

    async fn decode_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, BinanceError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<ApiErrorBody>(&body) {
                tracing::error!("Binance API error: {} - {}", err.code, err.msg);
                return Err(BinanceError::Api {
                    code: err.code,
                    msg: err.msg,
                });
            }
            tracing::error!("Binance HTTP error: {} - {}", status, body);
            return Err(BinanceError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }

    pub async fn ping(&self) -> Result<bool, BinanceError> {
        let url = format!("{}/fapi/v1/ping", self.config.base_url);
        let response = self.client.get(&url).send().await?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl ExchangeApi for BinanceClient {
    async fn fetch_balance_usdt(&self) -> Result<f64, BinanceError> {
        let balances: Vec<AssetBalance> = self
            .signed_request(Method::GET, "/fapi/v2/balance", vec![])
            .await?;
        balances
            .into_iter()
            .find(|b| b.asset == "USDT")
            .map(|b| b.available_balance)
            .ok_or(BinanceError::Api {
                code: -1,
                msg: "USDT balance not found".to_string(),
            })
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionRisk>, BinanceError> {
        self.signed_request(Method::GET, "/fapi/v2/positionRisk", vec![])
            .await
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, BinanceError> {
        self.signed_request(
            Method::GET,
            "/fapi/v1/openOrders",
            vec![("symbol", symbol.to_string())],
        )
        .await
    }

    async fn fetch_mark_price(&self, symbol: &str) -> Result<f64, BinanceError> {
        let index: PremiumIndex = self
            .keyed_request(
                Method::GET,
                "/fapi/v1/premiumIndex",
                vec![("symbol", symbol.to_string())],
            )
            .await?;
        Ok(index.mark_price)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, BinanceError> {
        self.signed_request(Method::POST, "/fapi/v1/order", request.to_params())
            .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), BinanceError> {
        let _: serde_json::Value = self
            .signed_request(
                Method::DELETE,
                "/fapi/v1/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn cancel_all_open_orders(&self, symbol: &str) -> Result<(), BinanceError> {
        let _: serde_json::Value = self
            .signed_request(
                Method::DELETE,
                "/fapi/v1/allOpenOrders",
                vec![("symbol", symbol.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), BinanceError> {
        let _: serde_json::Value = self
            .signed_request(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn set_margin_type(&self, symbol: &str, margin_type: &str) -> Result<(), BinanceError> {
        let _: serde_json::Value = self
            .signed_request(
                Method::POST,
                "/fapi/v1/marginType",
                vec![
                    ("symbol", symbol.to_string()),
                    ("marginType", margin_type.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn start_user_stream(&self) -> Result<String, BinanceError> {
        let response: ListenKeyResponse = self
            .keyed_request(Method::POST, "/fapi/v1/listenKey", vec![])
            .await?;
        Ok(response.listen_key)
    }

    async fn keepalive_user_stream(&self, _listen_key: &str) -> Result<(), BinanceError> {
        let _: serde_json::Value = self
            .keyed_request(Method::PUT, "/fapi/v1/listenKey", vec![])
            .await?;
        Ok(())
    }
}
