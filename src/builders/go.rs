use super::{prepend_path, BuildContext, BuildError, Builder, SourceTree};
use crate::app::App;
use crate::env::Env;
use crate::events::Event;
use async_trait::async_trait;

/// Go apps. Binaries are installed to `env/bin`.
pub struct GoBuilder;

#[async_trait]
impl Builder for GoBuilder {
    fn name(&self) -> &'static str {
        "Go"
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["go"]
    }

    fn accept(&self, tree: &SourceTree<'_>) -> bool {
        tree.has_any(&["go.mod", "Godeps"]) || tree.has_extension("go")
    }

    fn env(&self, app: &App, base: &Env) -> Env {
        let venv = app.env_path();
        let mut env = Env::new();
        env.set("GOPATH", venv.display());
        env.set("GOBIN", venv.join("bin").display());
        env.set("PATH", prepend_path(&[venv.join("bin")], base));
        env
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<String>, BuildError> {
        let bin = ctx.app.env_path().join("bin");
        let mut logs = Vec::new();

        if ctx.src_path().join("go.mod").exists() {
            ctx.emit(Event::InstallingDependencies);
            logs.extend(ctx.shell(self.name(), "go mod download").await?);
        }

        ctx.emit(Event::Compiling);
        let command = format!(
            "go build -o {}/ ./...",
            shell_words::quote(&bin.to_string_lossy())
        );
        logs.extend(ctx.shell(self.name(), &command).await?);
        Ok(logs)
    }
}
