//! 闭包工具：把「名称 + 分组 + schema + 异步函数」包装为 Tool
//!
//! 外部平台的 API 调用（租户、投诉、主数据等）都以这种形式注册，核心不关心函数内部做什么。

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::tools::group::{RiskLevel, ToolGroup};
use crate::tools::Tool;

type Invoke = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// 由异步闭包构建的工具
pub struct FnTool {
    name: String,
    description: String,
    group: ToolGroup,
    risk: RiskLevel,
    schema: Option<Value>,
    invoke: Invoke,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        group: ToolGroup,
        f: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            group,
            risk: RiskLevel::Read,
            schema: None,
            invoke: Arc::new(move |args| f(args).boxed()),
        }
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn group(&self) -> ToolGroup {
        self.group
    }

    fn risk(&self) -> RiskLevel {
        self.risk
    }

    fn parameters_schema(&self) -> Value {
        match &self.schema {
            Some(schema) => schema.clone(),
            None => serde_json::json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        (self.invoke)(args).await
    }
}
