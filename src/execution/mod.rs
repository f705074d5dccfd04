// Broker collaborators, retry policy and trade lifecycle
pub mod bridge;
pub mod broker;
pub mod lifecycle;
pub mod paper;
pub mod retry;

pub use bridge::BridgeClient;
pub use broker::{
    AccountInfo, BrokerGateway, BrokerPosition, CloseRequest, Fill, MarketData, OrderExecutor, OrderRequest,
    OrderResult,
};
pub use lifecycle::{LifecycleError, ProposedTrade, TradeBook};
pub use paper::PaperBroker;
pub use retry::RetryPolicy;
