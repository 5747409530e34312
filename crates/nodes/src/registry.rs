//! Executor registry: node kind → executor.

use std::collections::HashMap;
use std::sync::Arc;

use crate::builtin::{
    ConditionalNode, EntityBinderNode, FormulaNode, KpiWriterNode, ModelNode, SourceNode,
    StateMarkerNode, TransformNode, WebhookNode,
};
use crate::config::NodeKind;
use crate::domain::DomainRegistry;
use crate::model::{ChatCompletionsClient, ModelClient};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::ExecutableNode;

/// External collaborators the built-in executors need.
#[derive(Clone)]
pub struct Services {
    pub transport: Arc<dyn HttpTransport>,
    pub model: Arc<dyn ModelClient>,
    pub domain: Arc<dyn DomainRegistry>,
}

impl Services {
    /// Real HTTP transport and chat-completions client over `domain`.
    pub fn new(domain: Arc<dyn DomainRegistry>, http_timeout: std::time::Duration) -> Self {
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(http_timeout));
        Self {
            model: Arc::new(ChatCompletionsClient::new(Arc::clone(&transport))),
            transport,
            domain,
        }
    }
}

#[derive(Default, Clone)]
pub struct NodeRegistry {
    executors: HashMap<NodeKind, Arc<dyn ExecutableNode>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in executor wired to `services`.
    pub fn builtin(services: &Services) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SourceNode::new(Arc::clone(&services.domain))));
        registry.register(Arc::new(WebhookNode::new(Arc::clone(&services.transport))));
        registry.register(Arc::new(TransformNode::new(Arc::clone(&services.transport))));
        registry.register(Arc::new(ConditionalNode));
        registry.register(Arc::new(FormulaNode));
        registry.register(Arc::new(ModelNode::new(Arc::clone(&services.model))));
        registry.register(Arc::new(StateMarkerNode));
        registry.register(Arc::new(KpiWriterNode::new(Arc::clone(&services.domain))));
        registry.register(Arc::new(EntityBinderNode::new(Arc::clone(&services.domain))));
        registry
    }

    /// Register (or replace) the executor for its kind.
    pub fn register(&mut self, executor: Arc<dyn ExecutableNode>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn ExecutableNode>> {
        self.executors.get(&kind).cloned()
    }

    pub fn contains(&self, kind: NodeKind) -> bool {
        self.executors.contains_key(&kind)
    }
}
