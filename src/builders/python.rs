use super::{prepend_path, BuildContext, BuildError, Builder, SourceTree};
use crate::app::App;
use crate::env::Env;
use crate::events::Event;
use async_trait::async_trait;
use tracing::info;

/// Python apps, built into a per-app virtualenv
pub struct PythonBuilder;

#[async_trait]
impl Builder for PythonBuilder {
    fn name(&self) -> &'static str {
        "Python"
    }

    fn requirements(&self) -> &'static [&'static str] {
        &["python3"]
    }

    fn accept(&self, tree: &SourceTree<'_>) -> bool {
        tree.has_any(&["requirements.txt", "pyproject.toml"])
    }

    fn env(&self, app: &App, base: &Env) -> Env {
        let venv = app.env_path();
        let mut env = Env::new();
        env.set("VIRTUAL_ENV", venv.display());
        env.set("PATH", prepend_path(&[venv.join("bin")], base));
        env.set("PYTHONUNBUFFERED", "1");
        env.set("PYTHONIOENCODING", "UTF_8:replace");
        env
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<String>, BuildError> {
        let venv = ctx.app.env_path();
        let bin = venv.join("bin");
        let mut logs = Vec::new();

        if !bin.join("activate").exists() {
            ctx.emit(Event::CreatingBuildEnv);
            info!(app = %ctx.app.name(), path = %venv.display(), "Creating virtualenv");
            let command = format!("python3 -m venv {}", shell_words::quote(&venv.to_string_lossy()));
            logs.extend(ctx.shell(self.name(), &command).await?);
        }

        ctx.emit(Event::InstallingDependencies);
        let pip = shell_words::quote(&bin.join("pip").to_string_lossy()).into_owned();
        let command = if ctx.src_path().join("requirements.txt").exists() {
            format!("{} install -r requirements.txt", pip)
        } else {
            format!("{} install .", pip)
        };

        logs.extend(ctx.shell(self.name(), &command).await?);

        Ok(logs)
    }
}
