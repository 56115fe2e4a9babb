use super::{find_binary, prepend_path, BuildContext, BuildError, Builder, SourceTree};
use crate::app::App;
use crate::env::Env;
use crate::events::Event;
use async_trait::async_trait;
use tracing::{info, warn};

/// Node.js apps. `NODE_VERSION` selects a private node install via nodeenv.
pub struct NodeBuilder;

#[async_trait]
impl Builder for NodeBuilder {
    fn name(&self) -> &'static str {
        "Node"
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["npm"]
    }

    fn accept(&self, tree: &SourceTree<'_>) -> bool {
        tree.has_any(&["package.json"])
    }

    fn env(&self, app: &App, base: &Env) -> Env {
        let src = app.src_path();
        let venv = app.env_path();
        let mut env = Env::new();
        env.set("VIRTUAL_ENV", venv.display());
        env.set(
            "PATH",
            prepend_path(&[venv.join("bin"), src.join("node_modules/.bin")], base),
        );
        env.set("NODE_PATH", src.join("node_modules").display());
        env.set("NPM_CONFIG_PREFIX", src.display());
        env
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<String>, BuildError> {
        let venv = ctx.app.env_path();
        let src = ctx.src_path();
        let mut logs = Vec::new();

        if let Some(version) = ctx.env.get("NODE_VERSION") {
            let marker = venv.join(".node-version");
            let installed = std::fs::read_to_string(&marker).unwrap_or_default();
            if installed.trim() == version {
                info!(app = %ctx.app.name(), version = %version, "Node version already installed");
            } else if find_binary("nodeenv", ctx.env).is_some() {
                ctx.emit(Event::CreatingBuildEnv);
                let command = format!(
                    "nodeenv --prebuilt --node={} --clean-src --force {}",
                    shell_words::quote(version),
                    shell_words::quote(&venv.to_string_lossy())
                );
                logs.extend(ctx.shell(self.name(), &command).await?);
                std::fs::write(&marker, version).map_err(|source| BuildError::Io {
                    builder: self.name().to_string(),
                    source,
                })?;
            } else {
                warn!(app = %ctx.app.name(), "NODE_VERSION is set but nodeenv is not installed, using system node");
            }
        }

        ctx.emit(Event::InstallingDependencies);
        let command = format!(
            "npm install --prefix {} --package-lock=false",
            shell_words::quote(&src.to_string_lossy())
        );
        logs.extend(ctx.shell(self.name(), &command).await?);
        Ok(logs)
    }
}
