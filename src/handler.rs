use serde::{Deserialize, Serialize};
use thiserror::Error;
use tiktoken_rs::CoreBPE;
use tracing::debug;

/// Model whose encoding the counter uses (cl100k_base).
pub const TOKENIZER_MODEL: &str = "gpt-3.5-turbo";
pub const STATUS_OK: u16 = 200;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("request has no body")]
    MissingBody,
    #[error("failed to decode request body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("tokenizer unavailable: {0}")]
    Tokenizer(String),
}

/// Proxy-integration event as delivered by the gateway. Only `body` is read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyRequest {
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CountTokenRequest {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub status_code: u16,
    pub body: usize,
}

pub fn parse_event(raw: &str) -> Result<ProxyRequest, HandlerError> {
    Ok(serde_json::from_str(raw)?)
}

/// Counts the tokens a model would see for `text`.
///
/// [`TiktokenCounter`] encodes special-token strings such as `<|endoftext|>`
/// as ordinary text. Python tiktoken's default `encode()` raises on them
/// instead; the deployed function passes `disallowed_special=()` so both agree.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

pub struct TiktokenCounter {
    bpe: CoreBPE,
}

impl TiktokenCounter {
    pub fn for_model(model: &str) -> Result<Self, HandlerError> {
        let bpe = tiktoken_rs::get_bpe_from_model(model).map_err(|e| HandlerError::Tokenizer(e.to_string()))?;
        Ok(Self { bpe })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> usize {
        // special-token text is counted as ordinary text
        self.bpe.encode_ordinary(text).len()
    }
}

#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync {
    async fn call(&self, request: ProxyRequest) -> Result<ProxyResponse, HandlerError>;
}

pub struct CountTokenHandler<C> {
    counter: C,
}

impl CountTokenHandler<TiktokenCounter> {
    pub fn new() -> Result<Self, HandlerError> {
        Ok(Self::with_counter(TiktokenCounter::for_model(TOKENIZER_MODEL)?))
    }
}

impl<C: TokenCounter> CountTokenHandler<C> {
    pub fn with_counter(counter: C) -> Self { Self { counter } }

    pub fn handle(&self, request: &ProxyRequest) -> Result<ProxyResponse, HandlerError> {
        let body = request.body.as_deref().ok_or(HandlerError::MissingBody)?;
        let payload: CountTokenRequest = serde_json::from_str(body)?;
        let tokens = self.counter.count(&payload.content);
        debug!(chars = payload.content.chars().count(), tokens, "counted tokens");
        Ok(ProxyResponse { status_code: STATUS_OK, body: tokens })
    }
}

#[async_trait::async_trait]
impl<C: TokenCounter> RequestHandler for CountTokenHandler<C> {
    async fn call(&self, request: ProxyRequest) -> Result<ProxyResponse, HandlerError> {
        self.handle(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WordCounter;

    impl TokenCounter for WordCounter {
        fn count(&self, text: &str) -> usize { text.split_whitespace().count() }
    }

    fn request(body: &str) -> ProxyRequest {
        ProxyRequest { body: Some(body.to_string()) }
    }

    #[test]
    fn counts_hello_world_with_cl100k() {
        let handler = CountTokenHandler::new().unwrap();
        let res = handler.handle(&request(r#"{"content": "hello world"}"#)).unwrap();
        assert_eq!(res, ProxyResponse { status_code: 200, body: 2 });
    }

    #[test]
    fn empty_content_is_zero_tokens() {
        let handler = CountTokenHandler::new().unwrap();
        let res = handler.handle(&request(r#"{"content": ""}"#)).unwrap();
        assert_eq!(res.status_code, 200);
        assert_eq!(res.body, 0);
    }

    #[test]
    fn special_token_text_is_counted_as_text() {
        let handler = CountTokenHandler::new().unwrap();
        let res = handler.handle(&request(r#"{"content": "<|endoftext|>"}"#)).unwrap();
        assert!(res.body > 1);
    }

    #[test]
    fn missing_content_is_a_decode_error() {
        let handler = CountTokenHandler::with_counter(WordCounter);
        let err = handler.handle(&request(r#"{"text": "hello"}"#)).unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
        let err = handler.handle(&request("not json")).unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
        let err = handler.handle(&request(r#"{"content": 5}"#)).unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
    }

    #[test]
    fn missing_body_is_an_error() {
        let handler = CountTokenHandler::with_counter(WordCounter);
        let err = handler.handle(&ProxyRequest::default()).unwrap_err();
        assert!(matches!(err, HandlerError::MissingBody));
    }

    #[test]
    fn response_uses_proxy_field_names() {
        let res = ProxyResponse { status_code: STATUS_OK, body: 7 };
        let v = serde_json::to_value(&res).unwrap();
        assert_eq!(v, serde_json::json!({"statusCode": 200, "body": 7}));
    }

    #[test]
    fn parses_full_gateway_event() {
        let raw = r#"{"resource": "/count-token", "httpMethod": "POST", "body": "{\"content\": \"a b c\"}", "isBase64Encoded": false}"#;
        let event = parse_event(raw).unwrap();
        assert_eq!(event.body.as_deref(), Some(r#"{"content": "a b c"}"#));
    }

    #[tokio::test]
    async fn handler_trait_dispatch() {
        let handler: Box<dyn RequestHandler> = Box::new(CountTokenHandler::with_counter(WordCounter));
        let res = handler.call(request(r#"{"content": "one two three"}"#)).await.unwrap();
        assert_eq!(res.body, 3);
    }
}
