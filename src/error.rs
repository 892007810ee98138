use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("missing environment variable: {name}")]
    MissingVar { name: String },
    #[display("failed to parse {name}: {reason}")]
    Parse { name: String, reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
}

#[derive(Debug, Display, Error)]
pub enum ExchangeError {
    #[display("failed to connect to {exchange}")]
    Connection { exchange: String },
    #[display("request to {exchange} failed")]
    Request { exchange: String },
    #[display("failed to parse response from {exchange}")]
    ResponseParse { exchange: String },
    #[display("rate limit exceeded for {exchange}")]
    RateLimit { exchange: String },
    #[display("websocket stream for {exchange} closed unexpectedly")]
    StreamClosed { exchange: String },
}

#[derive(Debug, Display, Error)]
pub enum NotifierError {
    #[display("telegram request failed: {method}")]
    Request { method: String },
    #[display("telegram returned an error response for {method}: {description}")]
    ApiError { method: String, description: String },
}

#[derive(Debug, Display, Error)]
pub enum SettingsError {
    #[display("database migration failed")]
    Migration,
    #[display("failed to insert default settings row")]
    Insert,
    #[display("failed to query settings")]
    Query,
}

#[derive(Debug, Display, Error)]
pub enum ProducerError {
    #[display("failed to discover symbols for {exchange}")]
    Discovery { exchange: String },
    #[display("failed to start stream shard {shard}")]
    ShardStart { shard: usize },
}

#[derive(Debug, Display, Error)]
pub enum ConsumerError {
    #[display("failed to evaluate signal for {symbol}")]
    Evaluation { symbol: String },
    #[display("failed to deliver signal for {symbol}")]
    Delivery { symbol: String },
}

#[derive(Debug, Display, Error)]
pub enum ChartError {
    #[display("failed to render chart for {symbol}")]
    Render { symbol: String },
    #[display("failed to encode chart image for {symbol}")]
    Encode { symbol: String },
}
