use super::{check_binaries, BuildContext, BuildError, Builder, SourceTree};
use crate::app::App;
use crate::env::Env;
use crate::events::Event;
use async_trait::async_trait;

/// Clojure apps, built with Leiningen (`project.clj`) or the Clojure CLI
/// (`deps.edn`)
pub struct ClojureBuilder;

#[async_trait]
impl Builder for ClojureBuilder {
    fn name(&self) -> &'static str {
        "Clojure"
    }

    fn accept(&self, tree: &SourceTree<'_>) -> bool {
        tree.has_any(&["project.clj", "deps.edn"])
    }

    fn env(&self, app: &App, _base: &Env) -> Env {
        let venv = app.env_path();
        let mut env = Env::new();
        env.set("VIRTUAL_ENV", venv.display());
        env.set("LEIN_HOME", venv.join(".lein").display());
        env.set("CLJ_CONFIG", venv.join(".clojure").display());
        env
    }

    async fn build(&self, ctx: &BuildContext<'_>) -> Result<Vec<String>, BuildError> {
        let mut logs = Vec::new();
        ctx.emit(Event::Compiling);

        if ctx.src_path().join("project.clj").exists() {
            check_binaries(self.name(), &["java", "lein"], ctx.env)?;
            logs.extend(ctx.shell(self.name(), "lein clean").await?);
            logs.extend(ctx.shell(self.name(), "lein uberjar").await?);
        } else {
            check_binaries(self.name(), &["java", "clojure"], ctx.env)?;
            logs.extend(ctx.shell(self.name(), "clojure -T:build release").await?);
        }
        Ok(logs)
    }
}
