use super::{prepend_path, BuildContext, BuildError, Builder, SourceTree};
use crate::app::App;
use crate::env::Env;
use crate::events::Event;
use async_trait::async_trait;

/// Rust apps, compiled in release mode into the app's env directory
pub struct RustBuilder;

#[async_trait]
impl Builder for RustBuilder {
    fn name(&self) -> &'static str {
        "Rust"
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["cargo"]
    }

    fn accept(&self, tree: &SourceTree<'_>) -> bool {
        tree.has_any(&["Cargo.toml"])
    }

    fn env(&self, app: &App, base: &Env) -> Env {
        let target = app.env_path().join("target");
        let mut env = Env::new();
        env.set("CARGO_TARGET_DIR", target.display());
        env.set("PATH", prepend_path(&[target.join("release")], base));
        env
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<String>, BuildError> {
        ctx.emit(Event::Compiling);
        ctx.shell(self.name(), "cargo build --release").await
    }
}
