use super::{prepend_path, BuildContext, BuildError, Builder, SourceTree};
use crate::app::App;
use crate::env::Env;
use crate::events::Event;
use async_trait::async_trait;

/// Ruby apps, with gems vendored under the app's env directory
pub struct RubyBuilder;

#[async_trait]
impl Builder for RubyBuilder {
    fn name(&self) -> &'static str {
        "Ruby"
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["ruby", "gem", "bundle"]
    }

    fn accept(&self, tree: &SourceTree<'_>) -> bool {
        tree.has_any(&["Gemfile"])
    }

    fn env(&self, app: &App, base: &Env) -> Env {
        let venv = app.env_path();
        let mut env = Env::new();
        env.set("VIRTUAL_ENV", venv.display());
        env.set("PATH", prepend_path(&[venv.join("bin")], base));
        env
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<String>, BuildError> {
        let venv = ctx.app.env_path();
        let mut logs = Vec::new();

        if !venv.join(".bundle-configured").exists() {
            ctx.emit(Event::CreatingBuildEnv);
            std::fs::create_dir_all(&venv).map_err(|source| BuildError::Io {
                builder: self.name().to_string(),
                source,
            })?;
            let command = format!(
                "bundle config set --local path {}",
                shell_words::quote(&venv.to_string_lossy())
            );
            logs.extend(ctx.shell(self.name(), &command).await?);
            std::fs::write(venv.join(".bundle-configured"), b"").map_err(|source| {
                BuildError::Io {
                    builder: self.name().to_string(),
                    source,
                }
            })?;
        }

        ctx.emit(Event::InstallingDependencies);
        logs.extend(ctx.shell(self.name(), "bundle install").await?);
        Ok(logs)
    }
}
