pub mod flow;
pub mod http;
pub mod text;

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;

use weft_core::error::Result;
use weft_core::traits::NodeHandler;
use weft_core::types::OutputSnapshot;

/// Every built-in handler.
pub fn all() -> Vec<Arc<dyn NodeHandler>> {
    vec![
        Arc::new(flow::ConstantNode),
        Arc::new(flow::SequenceNode),
        Arc::new(flow::PassthroughNode),
        Arc::new(flow::DelayNode),
        Arc::new(flow::FailNode),
        Arc::new(flow::IterateNode),
        Arc::new(flow::CollectNode),
        Arc::new(text::TemplateNode),
        Arc::new(text::RegexExtractNode),
        Arc::new(text::JsonGetNode),
        Arc::new(http::HttpFetchNode),
    ]
}

/// A firing that produces exactly one emission.
pub(crate) fn emit_once<F>(fut: F) -> BoxStream<'static, Result<OutputSnapshot>>
where
    F: Future<Output = Result<OutputSnapshot>> + Send + 'static,
{
    stream::once(fut).boxed()
}
