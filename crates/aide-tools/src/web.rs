use aide_protocol::{ToolCall, ToolDefinition};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Value, json};

use crate::{ToolContext, ToolHandler, required_str};

const PAGE_TEXT_CHARS: usize = 3000;
const SEARCH_RESULTS: usize = 5;
const USER_AGENT: &str = "Mozilla/5.0 (compatible; aide/0.1)";

/// Base URLs of the public services the web tools talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebEndpoints {
    pub weather: String,
    pub search: String,
    pub stocks: String,
}

impl Default for WebEndpoints {
    fn default() -> Self {
        Self {
            weather: "https://wttr.in".to_owned(),
            search: "https://html.duckduckgo.com/html/".to_owned(),
            stocks: "https://query1.finance.yahoo.com".to_owned(),
        }
    }
}

/// Appends path segments to a base URL, percent-encoding each one.
fn endpoint(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid base URL {base}"))?;
    url.path_segments_mut()
        .map_err(|()| anyhow!("base URL {base} cannot carry a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn selector(css: &'static str) -> Result<Selector> {
    Selector::parse(css).map_err(|error| anyhow!("invalid selector {css}: {error:?}"))
}

/// Elements whose text never reaches the reader.
const HIDDEN_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            if !HIDDEN_ELEMENTS.contains(&child_element.value().name()) {
                collect_text(child_element, out);
            }
        } else if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        }
    }
}

/// Parses the document and joins its visible text nodes, collapsing
/// whitespace. Entities are decoded by the parser.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::with_capacity(html.len());
    collect_text(document.root_element(), &mut out);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone)]
pub struct FetchWebpageTool {
    client: reqwest::Client,
}

impl FetchWebpageTool {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ToolHandler for FetchWebpageTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "fetch_webpage",
            "Fetch and read the text content of a webpage URL.",
            json!({
                "type": "object",
                "properties": {"url": {"type": "string", "description": "Full URL to fetch"}},
                "required": ["url"]
            }),
        )
    }

    async fn call(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let url = required_str(call, "url")?;
        let url = Url::parse(url).with_context(|| format!("invalid URL: {url}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("only http and https URLs can be fetched");
        }

        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let text = html_to_text(&body);
        if text.is_empty() {
            return Ok("(Page had no readable text content)".to_owned());
        }
        match text.char_indices().nth(PAGE_TEXT_CHARS) {
            Some((cut, _)) => Ok(format!("{}... (truncated)", &text[..cut])),
            None => Ok(text),
        }
    }
}

/// Current conditions plus a short forecast from a wttr.in-compatible service.
#[derive(Debug, Clone)]
pub struct WeatherTool {
    client: reqwest::Client,
    base_url: String,
}

impl WeatherTool {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, WebEndpoints::default().weather)
    }

    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn forecast_url(&self, location: &str) -> Result<Url> {
        let mut url = endpoint(&self.base_url, &[location])?;
        url.query_pairs_mut().append_pair("format", "j1");
        Ok(url)
    }
}

fn field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("?")
}

fn description(value: &Value) -> &str {
    value
        .pointer("/weatherDesc/0/value")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
}

#[async_trait]
impl ToolHandler for WeatherTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "get_weather",
            "Get current weather and forecast for a location.",
            json!({
                "type": "object",
                "properties": {"location": {"type": "string", "description": "City name or location (e.g. 'London')"}},
                "required": ["location"]
            }),
        )
    }

    async fn call(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let location = required_str(call, "location")?;
        let data: Value = self
            .client
            .get(self.forecast_url(location)?)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("weather service returned invalid JSON")?;

        let current = data
            .pointer("/current_condition/0")
            .context("weather service returned no current conditions")?;
        let mut result = format!(
            "Weather in {location}: {}, {}°C ({}°F), feels like {}°C, humidity {}%, wind {} km/h.",
            description(current),
            field(current, "temp_C"),
            field(current, "temp_F"),
            field(current, "FeelsLikeC"),
            field(current, "humidity"),
            field(current, "windspeedKmph"),
        );

        let days = data.get("weather").and_then(Value::as_array);
        for day in days.into_iter().flatten().take(3) {
            let midday = day
                .pointer("/hourly/4")
                .map(description)
                .unwrap_or_default();
            result.push_str(&format!(
                "\n  {}: {}-{}°C, {midday}",
                field(day, "date"),
                field(day, "mintempC"),
                field(day, "maxtempC"),
            ));
        }
        Ok(result)
    }
}

/// Web search over the DuckDuckGo HTML endpoint.
#[derive(Debug, Clone)]
pub struct WebSearchTool {
    client: reqwest::Client,
    search_url: String,
}

impl WebSearchTool {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_search_url(client, WebEndpoints::default().search)
    }

    pub fn with_search_url(client: reqwest::Client, search_url: impl Into<String>) -> Self {
        Self {
            client,
            search_url: search_url.into(),
        }
    }

    /// Numbered results with title, link and snippet.
    pub async fn search(&self, query: &str, max_results: usize) -> Result<String> {
        let html = self
            .client
            .post(&self.search_url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .form(&[("q", query)])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let document = Html::parse_document(&html);
        let links = selector("a.result__a")?;
        let snippets = selector(".result__snippet")?;
        let snippets: Vec<String> = document
            .select(&snippets)
            .map(|snippet| squash(snippet.text()))
            .collect();

        let results: Vec<String> = document
            .select(&links)
            .take(max_results)
            .enumerate()
            .map(|(i, link)| {
                let title = squash(link.text());
                let href = link.value().attr("href").unwrap_or_default();
                let snippet = snippets.get(i).map(String::as_str).unwrap_or_default();
                format!("{}. {title}\n   {href}\n   {snippet}", i + 1)
            })
            .collect();

        if results.is_empty() {
            return Ok(format!("No results found for '{query}'."));
        }
        Ok(format!("Search results for '{query}':\n\n{}", results.join("\n\n")))
    }
}

fn squash<'a>(text: impl Iterator<Item = &'a str>) -> String {
    text.flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl ToolHandler for WebSearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "web_search",
            "Search the internet. Use when you need current info or don't know something.",
            json!({
                "type": "object",
                "properties": {"query": {"type": "string", "description": "Search query"}},
                "required": ["query"]
            }),
        )
    }

    async fn call(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        self.search(required_str(call, "query")?, SEARCH_RESULTS).await
    }
}

/// Headlines, answered by a news-flavoured web search.
#[derive(Debug, Clone)]
pub struct NewsTool {
    search: WebSearchTool,
}

impl NewsTool {
    pub fn new(search: WebSearchTool) -> Self {
        Self { search }
    }
}

#[async_trait]
impl ToolHandler for NewsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "get_news",
            "Get latest news headlines, optionally filtered by topic.",
            json!({
                "type": "object",
                "properties": {"topic": {"type": "string", "description": "News topic (e.g. 'technology'). Leave empty for top headlines."}},
                "required": []
            }),
        )
    }

    async fn call(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let topic = call
            .str_arg("topic")
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .unwrap_or("top news today");
        self.search.search(&format!("{topic} news"), SEARCH_RESULTS).await
    }
}

/// Latest price and daily change from a Yahoo-compatible chart API.
#[derive(Debug, Clone)]
pub struct StockPriceTool {
    client: reqwest::Client,
    base_url: String,
}

impl StockPriceTool {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, WebEndpoints::default().stocks)
    }

    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ToolHandler for StockPriceTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "get_stock_price",
            "Get current stock price and change for a ticker symbol.",
            json!({
                "type": "object",
                "properties": {"symbol": {"type": "string", "description": "Stock ticker symbol (e.g. 'AAPL')"}},
                "required": ["symbol"]
            }),
        )
    }

    async fn call(&self, _ctx: &ToolContext, call: &ToolCall) -> Result<String> {
        let symbol = required_str(call, "symbol")?.trim().to_uppercase();
        let data: Value = self
            .client
            .get(endpoint(&self.base_url, &["v8", "finance", "chart", symbol.as_str()])?)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .query(&[("interval", "1d"), ("range", "5d")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("stock service returned invalid JSON")?;

        let Some(meta) = data.pointer("/chart/result/0/meta") else {
            return Ok(format!("No data found for '{symbol}'."));
        };
        let currency = meta.get("currency").and_then(Value::as_str).unwrap_or("USD");
        let price = meta.get("regularMarketPrice").and_then(Value::as_f64);
        let previous = meta
            .get("chartPreviousClose")
            .and_then(Value::as_f64)
            .filter(|previous| *previous != 0.0);

        Ok(match (price, previous) {
            (Some(price), Some(previous)) => {
                let change = price - previous;
                let direction = if change > 0.0 { "up" } else { "down" };
                format!(
                    "{symbol}: {price} {currency} ({direction} {:.2}, {:.2}%)",
                    change.abs(),
                    change / previous * 100.0
                )
            }
            (Some(price), None) => format!("{symbol}: {price} {currency}"),
            (None, _) => format!("No price available for '{symbol}'."),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn call(name: &str, key: &str, value: &str) -> ToolCall {
        let mut args = Map::new();
        args.insert(key.into(), Value::String(value.into()));
        ToolCall::new(name, args, 1)
    }

    #[test]
    fn html_is_reduced_to_readable_text() {
        let html = "<html><head><style>p{color:red}</style><SCRIPT>var x = 1;</SCRIPT></head>\
                    <body><h1>Title</h1>\n<p>Fish &amp; chips</p></body></html>";
        assert_eq!(html_to_text(html), "Title Fish & chips");
    }

    #[test]
    fn literal_angle_brackets_keep_the_surrounding_text() {
        assert_eq!(
            html_to_text("<p>price < 5 dollars</p><p>more text here</p>"),
            "price < 5 dollars more text here"
        );
        assert_eq!(html_to_text("<p>unterminated <b"), "unterminated");
        assert_eq!(html_to_text("<p>caf&eacute; &amp; &#8364;5</p>"), "café & €5");
    }

    #[tokio::test]
    async fn fetches_and_strips_pages() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>Hello <b>world</b></p>"))
            .mount(&server)
            .await;

        let tool = FetchWebpageTool::new(reqwest::Client::new());
        let text = tool
            .call(
                &ToolContext::new("."),
                &call("fetch_webpage", "url", &format!("{}/article", server.uri())),
            )
            .await?;
        assert_eq!(text, "Hello world");
        Ok(())
    }

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let tool = FetchWebpageTool::new(reqwest::Client::new());
        let result = tool
            .call(&ToolContext::new("."), &call("fetch_webpage", "url", "file:///etc/passwd"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn weather_reports_current_conditions_and_forecast() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/London"))
            .and(query_param("format", "j1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "current_condition": [{
                    "weatherDesc": [{"value": "Light rain"}],
                    "temp_C": "12", "temp_F": "54", "FeelsLikeC": "10",
                    "humidity": "81", "windspeedKmph": "15"
                }],
                "weather": [{"date": "2026-10-19", "mintempC": "8", "maxtempC": "14", "hourly": []}]
            })))
            .mount(&server)
            .await;

        let tool = WeatherTool::with_base_url(reqwest::Client::new(), server.uri());
        let report = tool
            .call(&ToolContext::new("."), &call("get_weather", "location", "London"))
            .await?;
        assert_eq!(
            report,
            "Weather in London: Light rain, 12°C (54°F), feels like 10°C, humidity 81%, wind 15 km/h.\n  2026-10-19: 8-14°C, "
        );
        Ok(())
    }

    const SEARCH_PAGE: &str = r##"<html><body>
        <div class="result">
          <a class="result__a" href="https://www.rust-lang.org/">Rust <b>Programming</b> Language</a>
          <a class="result__snippet" href="#">A language empowering everyone.</a>
        </div>
        <div class="result">
          <a class="result__a" href="https://doc.rust-lang.org/book/">The Rust Book</a>
          <a class="result__snippet" href="#">Learn   Rust.</a>
        </div>
    </body></html>"##;

    #[tokio::test]
    async fn web_search_lists_titles_links_and_snippets() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/html/"))
            .and(body_string_contains("q=rust"))
            .and(header("user-agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_string(SEARCH_PAGE))
            .mount(&server)
            .await;

        let tool = WebSearchTool::with_search_url(reqwest::Client::new(), format!("{}/html/", server.uri()));
        let results = tool
            .call(&ToolContext::new("."), &call("web_search", "query", "rust"))
            .await?;
        assert_eq!(
            results,
            "Search results for 'rust':\n\n\
             1. Rust Programming Language\n   https://www.rust-lang.org/\n   A language empowering everyone.\n\n\
             2. The Rust Book\n   https://doc.rust-lang.org/book/\n   Learn Rust."
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_search_pages_report_no_results() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body></body></html>"))
            .mount(&server)
            .await;

        let tool = WebSearchTool::with_search_url(reqwest::Client::new(), server.uri());
        let results = tool.search("zzqx", 5).await?;
        assert_eq!(results, "No results found for 'zzqx'.");
        Ok(())
    }

    #[tokio::test]
    async fn news_searches_the_topic_or_top_headlines() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("q=top+news+today+news"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SEARCH_PAGE))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("q=technology+news"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SEARCH_PAGE))
            .expect(1)
            .mount(&server)
            .await;

        let news = NewsTool::new(WebSearchTool::with_search_url(reqwest::Client::new(), server.uri()));
        let ctx = ToolContext::new(".");
        let top = news.call(&ctx, &ToolCall::new("get_news", Map::new(), 1)).await?;
        assert!(top.starts_with("Search results for 'top news today news':"));
        let tech = news.call(&ctx, &call("get_news", "topic", "technology")).await?;
        assert!(tech.starts_with("Search results for 'technology news':"));
        Ok(())
    }

    #[tokio::test]
    async fn stock_price_reports_change_against_previous_close() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/AAPL"))
            .and(query_param("interval", "1d"))
            .and(query_param("range", "5d"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "chart": {"result": [{"meta": {
                    "regularMarketPrice": 189.84,
                    "chartPreviousClose": 187.5,
                    "currency": "USD"
                }}]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/NOPE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"chart": {"result": []}})))
            .mount(&server)
            .await;

        let tool = StockPriceTool::with_base_url(reqwest::Client::new(), server.uri());
        let ctx = ToolContext::new(".");
        let quote = tool.call(&ctx, &call("get_stock_price", "symbol", "aapl")).await?;
        assert_eq!(quote, "AAPL: 189.84 USD (up 2.34, 1.25%)");
        let missing = tool.call(&ctx, &call("get_stock_price", "symbol", "nope")).await?;
        assert_eq!(missing, "No data found for 'NOPE'.");
        Ok(())
    }
}
