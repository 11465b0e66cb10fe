//! Pangea (Banco Nacional de Precedentes) search client.
//!
//! Validates the request locally, calls the upstream search endpoint and
//! reshapes its loosely-typed `resultados` into [`PangeaResult`]. Upstream
//! failures come back as a `status: ERROR` outcome instead of an error, so
//! callers always receive a [`SearchOutcome`].

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::PangeaConfig;

pub const MIN_QUERY_CHARS: usize = 3;
pub const MAX_PAGE: i64 = 10;
const PAGE_SIZE: u32 = 10;

const DEFAULT_ORGAOS: &[&str] = &["STF", "STJ", "TST", "TSE", "STM", "TNU"];
const DEFAULT_ESPECIES: &[&str] = &[
    "SUM", "SV", "RG", "RR", "IRDR", "IAC", "IRR", "PUIL", "CT", "OJ", "TR", "NT",
];

static BLOCK_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(p|br|div|li|ul|ol|h[1-6]|tr|td|th|table|blockquote)\b[^>]*>")
        .expect("valid regex")
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

// ============================================================================
// Public request/response types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "first_page")]
    pub page: i64,
    #[serde(default)]
    pub strip_html: Option<bool>,
    #[serde(default)]
    pub orgaos: Option<Vec<String>>,
    #[serde(default)]
    pub especies: Option<Vec<String>>,
}

fn first_page() -> i64 {
    1
}

impl SearchRequest {
    #[cfg(test)]
    pub fn new(query: impl Into<String>, page: i64) -> Self {
        Self {
            query: query.into(),
            page,
            strip_html: None,
            orgaos: None,
            especies: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SearchStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOutcome {
    pub status: SearchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Upstream HTTP status when the upstream call itself failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub total: u64,
    pub results: Vec<PangeaResult>,
}

impl SearchOutcome {
    pub fn error(message: impl Into<String>, http_status: Option<u16>) -> Self {
        Self {
            status: SearchStatus::Error,
            message: Some(message.into()),
            http_status,
            total: 0,
            results: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == SearchStatus::Ok
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PangeaResult {
    pub id: String,
    pub especie: String,
    pub orgao: String,
    pub numero: String,
    pub titulo: String,
    pub tese: String,
    pub etiquetas: Vec<String>,
    pub fundamentos: Vec<String>,
    pub paradigmas: String,
    pub link_andamento: String,
    pub situacao: String,
}

/// Why a request was refused before reaching upstream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SearchValidationError {
    #[error("A consulta deve ter pelo menos {min} caracteres", min = MIN_QUERY_CHARS)]
    QueryTooShort,
    #[error("Página {0} fora do intervalo permitido (de 1 até o limite máximo de {max})", max = MAX_PAGE)]
    PageOutOfRange(i64),
}

pub fn validate(request: &SearchRequest) -> Result<(), SearchValidationError> {
    if request.query.trim().chars().count() < MIN_QUERY_CHARS {
        return Err(SearchValidationError::QueryTooShort);
    }
    if !(1..=MAX_PAGE).contains(&request.page) {
        return Err(SearchValidationError::PageOutOfRange(request.page));
    }
    Ok(())
}

// ============================================================================
// Upstream wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct UpstreamRequest<'a> {
    filtro: UpstreamFilter<'a>,
    pagina: i64,
    #[serde(rename = "tamanhoPagina")]
    tamanho_pagina: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpstreamFilter<'a> {
    busca_geral: &'a str,
    orgaos: Vec<String>,
    especies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamResponse {
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    resultados: Vec<UpstreamResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UpstreamResult {
    id: Option<Value>,
    #[serde(alias = "tipo")]
    especie: Option<String>,
    orgao: Option<String>,
    #[serde(alias = "nr")]
    numero: Option<Value>,
    #[serde(alias = "questao")]
    titulo: Option<String>,
    tese: Option<String>,
    etiquetas: Vec<TextItem>,
    fundamentos: Vec<TextItem>,
    paradigmas: Option<Value>,
    link_andamento: Option<String>,
    situacao: Option<String>,
    highlight: HashMap<String, Value>,
}

/// Tag-like entries arrive as `{"texto": ".."}` or as bare strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TextItem {
    Object { texto: String },
    Plain(String),
}

impl TextItem {
    fn into_text(self) -> String {
        match self {
            TextItem::Object { texto } => texto,
            TextItem::Plain(text) => text,
        }
    }
}

// ============================================================================
// Normalization
// ============================================================================

/// Remove markup, decode the common entities and collapse whitespace.
pub fn strip_html(text: &str) -> String {
    let spaced = BLOCK_TAG_RE.replace_all(text, " ");
    let without_tags = TAG_RE.replace_all(&spaced, "");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    SPACE_RE.replace_all(decoded.trim(), " ").into_owned()
}

/// Scalar or list value rendered as plain text.
fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::Object(map) => map.get("texto").and_then(value_text),
                other => value_text(other),
            })
            .collect::<Vec<_>>()
            .join("; "),
        Value::Object(map) => map.get("texto").and_then(value_text)?,
    };
    (!text.trim().is_empty()).then_some(text)
}

impl UpstreamResult {
    /// Highlighted fragment for `field`, if upstream sent a non-empty one.
    fn highlighted(&self, field: &str) -> Option<String> {
        let fragment = match self.highlight.get(field)? {
            Value::Array(parts) => parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" ... "),
            other => value_text(other)?,
        };
        (!fragment.trim().is_empty()).then_some(fragment)
    }

    fn normalize(self, strip: bool) -> PangeaResult {
        let clean = |text: String| if strip { strip_html(&text) } else { text };

        let titulo = self
            .highlighted("titulo")
            .or_else(|| self.highlighted("questao"))
            .or_else(|| self.titulo.clone())
            .unwrap_or_default();
        let tese = self
            .highlighted("tese")
            .or_else(|| self.tese.clone())
            .unwrap_or_default();
        let paradigmas = self
            .highlighted("paradigmas")
            .or_else(|| self.paradigmas.as_ref().and_then(value_text))
            .unwrap_or_default();

        PangeaResult {
            id: self.id.as_ref().and_then(value_text).unwrap_or_default(),
            especie: self.especie.unwrap_or_default(),
            orgao: self.orgao.unwrap_or_default(),
            numero: self.numero.as_ref().and_then(value_text).unwrap_or_default(),
            titulo: clean(titulo),
            tese: clean(tese),
            etiquetas: self
                .etiquetas
                .into_iter()
                .map(|t| clean(t.into_text()))
                .collect(),
            fundamentos: self
                .fundamentos
                .into_iter()
                .map(|t| clean(t.into_text()))
                .collect(),
            paradigmas: clean(paradigmas),
            link_andamento: self.link_andamento.unwrap_or_default(),
            situacao: self.situacao.unwrap_or_default(),
        }
    }
}

fn filter_or_default(values: Option<&[String]>, defaults: &[&str]) -> Vec<String> {
    match values {
        Some(list) if !list.is_empty() => list.to_vec(),
        _ => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Clone)]
pub struct PangeaClient {
    client: Client,
    api_url: String,
}

impl PangeaClient {
    pub fn new(config: &PangeaConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
        })
    }

    /// Run a search. Never fails: problems are reported in the outcome.
    pub async fn search(&self, request: &SearchRequest) -> SearchOutcome {
        if let Err(e) = validate(request) {
            debug!("Pangea search rejected: {}", e);
            return SearchOutcome::error(e.to_string(), None);
        }

        let body = UpstreamRequest {
            filtro: UpstreamFilter {
                busca_geral: request.query.trim(),
                orgaos: filter_or_default(request.orgaos.as_deref(), DEFAULT_ORGAOS),
                especies: filter_or_default(request.especies.as_deref(), DEFAULT_ESPECIES),
            },
            pagina: request.page,
            tamanho_pagina: PAGE_SIZE,
        };

        info!(
            "Pangea search: query={:?} page={}",
            body.filtro.busca_geral, body.pagina
        );

        let response = match self.client.post(&self.api_url).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Pangea request failed: {}", e);
                return SearchOutcome::error(format!("Falha ao consultar o Pangea: {}", e), None);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Pangea API error ({}): {}", status, text);
            return SearchOutcome::error(
                format!("Erro na consulta ao Pangea: HTTP {}", status.as_u16()),
                Some(status.as_u16()),
            );
        }

        let parsed: UpstreamResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Pangea response could not be decoded: {}", e);
                return SearchOutcome::error("Resposta inválida do Pangea", None);
            }
        };

        let strip = request.strip_html.unwrap_or(true);
        let results: Vec<PangeaResult> = parsed
            .resultados
            .into_iter()
            .map(|r| r.normalize(strip))
            .collect();
        let total = parsed.total.unwrap_or(results.len() as u64);

        debug!("Pangea returned {} results (total {})", results.len(), total);
        SearchOutcome {
            status: SearchStatus::Ok,
            message: None,
            http_status: None,
            total,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Serve `reply` on a local port and return a client pointed at it plus a hit counter.
    async fn fake_upstream(status: StatusCode, reply: Value) -> (PangeaClient, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/precedentes",
            post(move |Json(_body): Json<Value>| {
                let counter = counter.clone();
                let reply = reply.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (status, Json(reply))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = PangeaClient::new(&PangeaConfig {
            api_url: format!("http://{}/precedentes", addr),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        (client, hits)
    }

    fn sample_response() -> Value {
        json!({
            "total": 42,
            "resultados": [{
                "id": 123,
                "tipo": "SUM",
                "orgao": "STJ",
                "nr": 7,
                "questao": "Reexame de <b>prova</b>",
                "tese": "A pretensão de simples reexame de prova não enseja recurso especial.",
                "highlight": {
                    "tese": ["A pretensão de simples <mark>reexame</mark> de prova não enseja recurso especial."]
                },
                "etiquetas": [{"texto": "x"}, {"texto": "y"}],
                "fundamentos": [{"texto": "CPC, art. 1.029"}],
                "paradigmas": "REsp 1.234/SP",
                "linkAndamento": "https://example.test/sum/7",
                "situacao": "Vigente"
            }]
        })
    }

    #[tokio::test]
    async fn test_short_query_makes_no_call() {
        let (client, hits) = fake_upstream(StatusCode::OK, sample_response()).await;

        for query in ["", "ab", "  a  ", " xy "] {
            let outcome = client.search(&SearchRequest::new(query, 1)).await;
            assert_eq!(outcome.status, SearchStatus::Error);
            assert!(outcome.results.is_empty());
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_page_out_of_range_makes_no_call() {
        let (client, hits) = fake_upstream(StatusCode::OK, sample_response()).await;

        for page in [0, -1, 11, 100] {
            let outcome = client.search(&SearchRequest::new("dano moral", page)).await;
            assert_eq!(outcome.status, SearchStatus::Error);
            assert!(outcome.message.unwrap().contains("limite máximo"));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_strips_html_and_prefers_highlight() {
        let (client, hits) = fake_upstream(StatusCode::OK, sample_response()).await;

        let outcome = client.search(&SearchRequest::new("reexame", 1)).await;
        assert!(outcome.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.total, 42);

        let result = &outcome.results[0];
        assert_eq!(result.id, "123");
        assert_eq!(result.especie, "SUM");
        assert_eq!(result.numero, "7");
        assert_eq!(result.titulo, "Reexame de prova");
        assert!(!result.tese.contains("<mark>"));
        assert_eq!(
            result.tese,
            "A pretensão de simples reexame de prova não enseja recurso especial."
        );
        assert_eq!(result.etiquetas, vec!["x", "y"]);
        assert_eq!(result.fundamentos, vec!["CPC, art. 1.029"]);
        assert_eq!(result.paradigmas, "REsp 1.234/SP");
        assert_eq!(result.link_andamento, "https://example.test/sum/7");
        assert_eq!(result.situacao, "Vigente");
    }

    #[tokio::test]
    async fn test_strip_html_false_keeps_markup() {
        let (client, _) = fake_upstream(StatusCode::OK, sample_response()).await;

        let mut request = SearchRequest::new("reexame", 1);
        request.strip_html = Some(false);
        let outcome = client.search(&request).await;

        let result = &outcome.results[0];
        assert_eq!(
            result.tese,
            "A pretensão de simples <mark>reexame</mark> de prova não enseja recurso especial."
        );
        assert_eq!(result.titulo, "Reexame de <b>prova</b>");
    }

    #[tokio::test]
    async fn test_upstream_error_is_recovered() {
        let (client, hits) =
            fake_upstream(StatusCode::INTERNAL_SERVER_ERROR, json!({"erro": "falhou"})).await;

        let outcome = client.search(&SearchRequest::new("dano moral", 2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.status, SearchStatus::Error);
        assert_eq!(outcome.http_status, Some(500));
        assert!(outcome.results.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_recovered() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = PangeaClient::new(&PangeaConfig {
            api_url: format!("http://{}/precedentes", addr),
            timeout: Duration::from_secs(2),
        })
        .unwrap();
        let outcome = client.search(&SearchRequest::new("dano moral", 1)).await;
        assert_eq!(outcome.status, SearchStatus::Error);
        assert!(outcome.http_status.is_none());
    }

    #[test]
    fn test_missing_fields_default() {
        let raw: UpstreamResult = serde_json::from_value(json!({"id": "abc"})).unwrap();
        let result = raw.normalize(true);
        assert_eq!(result.id, "abc");
        assert_eq!(result.tese, "");
        assert!(result.etiquetas.is_empty());
    }

    #[test]
    fn test_empty_highlight_falls_back_to_field() {
        let raw: UpstreamResult = serde_json::from_value(json!({
            "tese": "texto <i>original</i>",
            "highlight": {"tese": []}
        }))
        .unwrap();
        assert_eq!(raw.normalize(true).tese, "texto original");
    }

    #[test]
    fn test_plain_string_tags() {
        let raw: UpstreamResult =
            serde_json::from_value(json!({"etiquetas": ["a", {"texto": "b"}]})).unwrap();
        assert_eq!(raw.normalize(true).etiquetas, vec!["a", "b"]);
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(
            strip_html("<p>Tese&nbsp;<mark>firmada</mark></p>\n<p>&quot;A&quot; &amp; B</p>"),
            "Tese firmada \"A\" & B"
        );
        assert_eq!(strip_html("sem marcação"), "sem marcação");
    }

    #[test]
    fn test_default_filters() {
        assert_eq!(filter_or_default(None, DEFAULT_ORGAOS).len(), DEFAULT_ORGAOS.len());
        assert_eq!(filter_or_default(Some(&[]), DEFAULT_ORGAOS).len(), DEFAULT_ORGAOS.len());
        let custom = vec!["TRF2".to_string()];
        assert_eq!(filter_or_default(Some(&custom), DEFAULT_ORGAOS), custom);
    }
}
