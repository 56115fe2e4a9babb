use super::{BuildContext, BuildError, Builder, SourceTree};
use crate::events::Event;
use async_trait::async_trait;

/// PHP apps with Composer dependencies
pub struct PhpBuilder;

#[async_trait]
impl Builder for PhpBuilder {
    fn name(&self) -> &'static str {
        "PHP"
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["composer"]
    }

    fn accept(&self, tree: &SourceTree<'_>) -> bool {
        tree.has_any(&["composer.json"])
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<String>, BuildError> {
        ctx.emit(Event::InstallingDependencies);
        ctx.shell(self.name(), "composer install --no-interaction").await
    }
}
