use super::NodeRpc;
use crate::error::RpcError;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

const CLIENT_ID: &str = "vtc-indexer";

#[derive(Serialize, Debug)]
struct RpcRequest<'a> {
    jsonrpc: &'a str,
    id: &'a str,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize, Debug)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize, Debug)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC 1.0 client for vertcoind.
pub struct JsonRpcClient {
    client: Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
}

impl JsonRpcClient {
    pub fn new(
        url: impl Into<String>,
        user: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RpcError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            user,
            password,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: CLIENT_ID,
            method,
            params,
        };
        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(user) = &self.user {
            builder = builder.basic_auth(user, self.password.as_ref());
        }
        let response = builder.send().await?;

        // The node reports RPC errors with a non-2xx status and a JSON body,
        // so the body is read before looking at the status.
        let status = response.status();
        let body: RpcResponse = match response.json().await {
            Ok(body) => body,
            Err(_) if !status.is_success() => {
                return Err(RpcError::InvalidResponse {
                    method: method.to_string(),
                    reason: format!("HTTP {}", status),
                });
            }
            Err(e) => return Err(e.into()),
        };
        decode_response(method, body)
    }
}

fn decode_response<T: DeserializeOwned>(method: &str, body: RpcResponse) -> Result<T, RpcError> {
    if let Some(error) = body.error {
        return Err(RpcError::Node {
            code: error.code,
            message: error.message,
        });
    }
    let result = body
        .result
        .filter(|value| !value.is_null())
        .ok_or_else(|| RpcError::EmptyResult(method.to_string()))?;
    serde_json::from_value(result).map_err(|e| RpcError::InvalidResponse {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl NodeRpc for JsonRpcClient {
    async fn get_raw_mempool(&self) -> Result<Vec<String>, RpcError> {
        self.call("getrawmempool", json!([])).await
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, RpcError> {
        let raw: String = self.call("getrawtransaction", json!([txid, false])).await?;
        hex::decode(raw.trim()).map_err(|e| RpcError::InvalidResponse {
            method: "getrawtransaction".to_string(),
            reason: e.to_string(),
        })
    }
}
