//! Key-gated web search over HTTP for the `WEB:` marker.
//!
//! Providers: brave, serpapi, tavily. Every failure mode (empty query,
//! missing key, unknown provider, transport error) yields an `ok:false`
//! payload that is still recorded on the ledger.

use std::env;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

const HTTP_TIMEOUT_S: u64 = 30;
const DEFAULT_LIMIT: u64 = 5;
const MAX_LIMIT: u64 = 10;

fn default_provider() -> String {
    env::var("PMM_WEB_PROVIDER").unwrap_or_else(|_| "brave".to_string())
}

fn cap_limit(limit: Option<u64>) -> u64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

fn load_key(provider: &str) -> Option<String> {
    let (primary, fallback) = match provider {
        "brave" => ("PMM_BRAVE_API_KEY", "BRAVE_API_KEY"),
        "serpapi" => ("PMM_SERPAPI_API_KEY", "SERPAPI_API_KEY"),
        "tavily" => ("PMM_TAVILY_API_KEY", "TAVILY_API_KEY"),
        _ => return None,
    };
    env::var(primary).or_else(|_| env::var(fallback)).ok()
}

fn failure(provider: &str, query: &str, limit: u64, error: String) -> Value {
    json!({
        "ok": false,
        "provider": if provider.is_empty() { "unknown" } else { provider },
        "query": query,
        "limit": limit,
        "results": [],
        "error": error,
    })
}

pub fn run_web_search(query: &str, provider: Option<&str>, limit: Option<u64>) -> Value {
    let provider_name = provider
        .map(str::to_string)
        .unwrap_or_else(default_provider)
        .trim()
        .to_lowercase();
    let limit = cap_limit(limit);
    let query = query.trim();

    if query.is_empty() {
        return failure(&provider_name, query, limit, "empty query".to_string());
    }
    let Some(api_key) = load_key(&provider_name) else {
        return failure(
            &provider_name,
            query,
            limit,
            format!("missing API key for provider '{provider_name}'"),
        );
    };

    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_S))
        .build()
    {
        Ok(client) => client,
        Err(err) => return failure(&provider_name, query, limit, format!("request failed: {err}")),
    };

    let fetched = match provider_name.as_str() {
        "brave" => brave(&client, &api_key, query, limit),
        "serpapi" => serpapi(&client, &api_key, query, limit),
        "tavily" => tavily(&client, &api_key, query, limit),
        other => {
            return failure(&provider_name, query, limit, format!("unknown provider '{other}'"))
        }
    };

    match fetched {
        Ok(results) => {
            debug!(provider = %provider_name, hits = results.len(), "web search ok");
            json!({
                "ok": true,
                "provider": provider_name,
                "query": query,
                "limit": limit,
                "results": results,
                "error": null,
            })
        }
        Err(err) => failure(&provider_name, query, limit, format!("request failed: {err}")),
    }
}

fn brave(
    client: &reqwest::blocking::Client,
    key: &str,
    query: &str,
    limit: u64,
) -> Result<Vec<Value>, String> {
    let data: Value = client
        .get("https://api.search.brave.com/res/v1/web/search")
        .query(&[("q", query), ("count", &limit.to_string())])
        .header("Accept", "application/json")
        .header("X-Subscription-Token", key)
        .send()
        .map_err(|e| e.to_string())?
        .json()
        .map_err(|e| e.to_string())?;
    let raw = data["web"]["results"].as_array().cloned().unwrap_or_default();
    Ok(raw
        .iter()
        .take(limit as usize)
        .map(|r| {
            json!({
                "title": r["title"].as_str().unwrap_or(""),
                "url": r["url"].as_str().unwrap_or(""),
                "snippet": r["description"].as_str().unwrap_or(""),
            })
        })
        .collect())
}

fn serpapi(
    client: &reqwest::blocking::Client,
    key: &str,
    query: &str,
    limit: u64,
) -> Result<Vec<Value>, String> {
    let data: Value = client
        .get("https://serpapi.com/search.json")
        .query(&[
            ("engine", "google"),
            ("q", query),
            ("num", &limit.to_string()),
            ("api_key", key),
        ])
        .header("Accept", "application/json")
        .send()
        .map_err(|e| e.to_string())?
        .json()
        .map_err(|e| e.to_string())?;
    let raw = data["organic_results"].as_array().cloned().unwrap_or_default();
    Ok(raw
        .iter()
        .take(limit as usize)
        .map(|r| {
            json!({
                "title": r["title"].as_str().unwrap_or(""),
                "url": r["link"].as_str().unwrap_or(""),
                "snippet": r["snippet"].as_str().unwrap_or(""),
            })
        })
        .collect())
}

fn tavily(
    client: &reqwest::blocking::Client,
    key: &str,
    query: &str,
    limit: u64,
) -> Result<Vec<Value>, String> {
    let data: Value = client
        .post("https://api.tavily.com/search")
        .json(&json!({
            "api_key": key,
            "query": query,
            "max_results": limit,
            "include_images": false,
            "include_answer": false,
        }))
        .send()
        .map_err(|e| e.to_string())?
        .json()
        .map_err(|e| e.to_string())?;
    let raw = data["results"].as_array().cloned().unwrap_or_default();
    Ok(raw
        .iter()
        .take(limit as usize)
        .map(|r| {
            json!({
                "title": r["title"].as_str().unwrap_or(""),
                "url": r["url"].as_str().unwrap_or(""),
                "snippet": r["content"].as_str().unwrap_or(""),
            })
        })
        .collect())
}
