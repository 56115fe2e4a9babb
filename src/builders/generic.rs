//! Builders driven by the Procfile rather than by language files

use super::{BuildContext, BuildError, Builder, SourceTree};
use crate::events::Event;
use async_trait::async_trait;

/// Apps that build themselves with a `build` Procfile entry
pub struct ProcfileBuilder;

#[async_trait]
impl Builder for ProcfileBuilder {
    fn name(&self) -> &'static str {
        "Procfile"
    }

    fn accept(&self, tree: &SourceTree<'_>) -> bool {
        tree.manifest.contains("build")
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<String>, BuildError> {
        ctx.emit(Event::RunningHook {
            name: "build".to_string(),
        });
        ctx.shell(self.name(), ctx.manifest.build()).await
    }
}

/// Prebuilt apps: nothing to build, the `release` hook prepares them
pub struct GenericBuilder;

#[async_trait]
impl Builder for GenericBuilder {
    fn name(&self) -> &'static str {
        "Generic"
    }

    fn accept(&self, tree: &SourceTree<'_>) -> bool {
        tree.manifest.contains("release") && tree.manifest.contains("web")
    }

    async fn build(&self, _ctx: &BuildContext<'_>) -> Result<Vec<String>, BuildError> {
        Ok(Vec::new())
    }
}

/// Static sites served straight from the checkout by the proxy
pub struct StaticBuilder;

#[async_trait]
impl Builder for StaticBuilder {
    fn name(&self) -> &'static str {
        "Static"
    }

    fn accept(&self, tree: &SourceTree<'_>) -> bool {
        tree.manifest.contains("static")
    }

    async fn build(&self, _ctx: &BuildContext<'_>) -> Result<Vec<String>, BuildError> {
        Ok(Vec::new())
    }
}
