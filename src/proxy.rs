//! nginx site configuration for deployed apps
//!
//! [`ProxyConfigurator::render`] turns an app's environment and Procfile
//! into one nginx site file. Rendering only reads the environment and, when
//! `NGINX_INCLUDE_FILE` is set, one file from the checkout, so the same inputs
//! always produce the same bytes.
//!
//! Variables understood:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `NGINX_SERVER_NAME` | Comma separated host names. Without it the app is not routed. |
//! | `NGINX_HTTPS_ONLY` | Port 80 only serves ACME challenges and redirects to HTTPS |
//! | `NGINX_IPV4_ADDRESS`, `NGINX_IPV6_ADDRESS` | Listen addresses |
//! | `DISABLE_IPV6` | No IPv6 listeners |
//! | `NGINX_STATIC_PATHS` | `/prefix:dir[,/prefix:dir]` static mappings |
//! | `NGINX_ALLOW_GIT_FOLDERS` | Do not block `.git` paths |
//! | `NGINX_INCLUDE_FILE` | Extra server clauses, expanded against the environment |
//! | `NGINX_CACHE_PREFIXES` | Cache responses under these prefixes |
//! | `NGINX_ACL` | Raw allow/deny clauses for the app location |

use crate::app::App;
use crate::config::{NginxConfig, PathsConfig};
use crate::env::Env;
use crate::procfile::Procfile;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_IPV4_ADDRESS: &str = "0.0.0.0";
const DEFAULT_IPV6_ADDRESS: &str = "[::]";
const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

const GZIP_TYPES: &str = "text/plain text/xml text/css text/javascript text/js \
application/x-javascript application/javascript application/json \
application/xml+rss application/atom+xml image/svg+xml";

const UWSGI_PARAMS: &[(&str, &str)] = &[
    ("QUERY_STRING", "$query_string"),
    ("REQUEST_METHOD", "$request_method"),
    ("CONTENT_TYPE", "$content_type"),
    ("CONTENT_LENGTH", "$content_length"),
    ("REQUEST_URI", "$request_uri"),
    ("PATH_INFO", "$document_uri"),
    ("DOCUMENT_ROOT", "$document_root"),
    ("SERVER_PROTOCOL", "$server_protocol"),
    ("X_FORWARDED_FOR", "$proxy_add_x_forwarded_for"),
    ("REMOTE_ADDR", "$remote_addr"),
    ("REMOTE_PORT", "$remote_port"),
    ("SERVER_ADDR", "$server_addr"),
    ("SERVER_PORT", "$server_port"),
    ("SERVER_NAME", "$server_name"),
];

const PROXY_HEADERS: &[(&str, &str)] = &[
    ("Upgrade", "$http_upgrade"),
    ("Connection", "\"upgrade\""),
    ("Host", "$host"),
    ("X-Forwarded-Proto", "$scheme"),
    ("X-Forwarded-For", "$proxy_add_x_forwarded_for"),
    ("X-Remote-Address", "$remote_addr"),
    ("X-Forwarded-Port", "$server_port"),
    ("X-Request-Start", "$msec"),
];

#[derive(Debug, Error)]
pub enum ProxyConfigError {
    #[error("invalid NGINX_STATIC_PATHS entry '{0}': expected /prefix:dir")]
    InvalidStaticPath(String),

    #[error("{0} must be set to route web workers")]
    MissingVariable(&'static str),

    #[error("cannot read NGINX_INCLUDE_FILE {path}: {source}")]
    IncludeFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate generation failed: {0}")]
    Certificate(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A URL prefix served straight from a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticMapping {
    pub url: String,
    pub path: PathBuf,
}

/// Rendered nginx site for one app
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub app: String,
    pub server_names: Vec<String>,
    pub static_mappings: Vec<StaticMapping>,
    /// Address nginx forwards to, if the app has a web worker
    pub upstream: Option<String>,
    /// Cache directory the site expects to exist
    pub cache_path: Option<PathBuf>,
    pub content: String,
}

impl ProxyConfig {
    pub fn file_name(&self) -> String {
        format!("{}.conf", self.app)
    }

    /// True when the app has host names and gets server blocks
    pub fn is_routed(&self) -> bool {
        !self.server_names.is_empty()
    }
}

/// Renders nginx sites under the configured paths
pub struct ProxyConfigurator<'a> {
    paths: &'a PathsConfig,
    nginx: &'a NginxConfig,
}

impl<'a> ProxyConfigurator<'a> {
    pub fn new(paths: &'a PathsConfig, nginx: &'a NginxConfig) -> Self {
        Self { paths, nginx }
    }

    /// Render the site for `app`. Never fails for an empty environment or
    /// Procfile: an app without host names gets a config with no routes.
    pub fn render(
        &self,
        app: &App,
        env: &Env,
        workers: &Procfile,
    ) -> Result<ProxyConfig, ProxyConfigError> {
        let name = app.name();
        let static_mappings = static_paths(&app.src_path(), env, workers)?;
        let server_names = server_names(env);

        if server_names.is_empty() {
            debug!(app = %name, "No NGINX_SERVER_NAME, app is not routed");
            return Ok(ProxyConfig {
                app: name.to_string(),
                server_names,
                static_mappings,
                upstream: None,
                cache_path: None,
                content: format!("# {}: no NGINX_SERVER_NAME set, no routes\n", name),
            });
        }

        let uses_uwsgi = workers.contains("wsgi") || workers.contains("jwsgi");
        let upstream = if uses_uwsgi {
            Some(format!("unix:{}", self.socket_path(name).display()))
        } else if workers.has_web_worker() {
            let bind = env.get_or("BIND_ADDRESS", DEFAULT_BIND_ADDRESS);
            let port = env
                .get("PORT")
                .ok_or(ProxyConfigError::MissingVariable("PORT"))?;
            Some(format!("{}:{}", bind, port))
        } else {
            None
        };
        if let Some(target) = &upstream {
            info!(app = %name, upstream = %target, "nginx will forward to app");
        }

        let site = Site {
            app: name,
            env,
            nginx_root: self.paths.nginx(),
            acme_www: self.paths.acme_www(),
            ssl_listen: &self.nginx.ssl_listen,
            server_names: &server_names,
            ipv4: env.get_or("NGINX_IPV4_ADDRESS", DEFAULT_IPV4_ADDRESS),
            ipv6: if env.get_bool("DISABLE_IPV6", false) {
                None
            } else {
                Some(env.get_or("NGINX_IPV6_ADDRESS", DEFAULT_IPV6_ADDRESS))
            },
            directive: if uses_uwsgi { "uwsgi" } else { "proxy" },
            upstream: upstream.as_deref(),
        };

        let custom = match env.get("NGINX_INCLUDE_FILE").filter(|f| !f.is_empty()) {
            Some(file) => {
                let path = resolve(&app.src_path(), file);
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| ProxyConfigError::IncludeFile { path, source })?;
                Some(env.expand(&text))
            }
            None => None,
        };

        let cache = match (&upstream, env.get("NGINX_CACHE_PREFIXES")) {
            (Some(_), Some(prefixes)) if !prefixes.trim().is_empty() => {
                Some(CacheSettings::from_env(env, prefixes, &self.paths.cache().join(name)))
            }
            _ => None,
        };

        let content = site.render(&static_mappings, cache.as_ref(), custom.as_deref());
        info!(app = %name, hosts = %server_names.join(" "), "Rendered nginx site");

        Ok(ProxyConfig {
            app: name.to_string(),
            server_names,
            static_mappings,
            upstream,
            cache_path: cache.map(|c| c.path),
            content,
        })
    }

    /// Unix socket shared by nginx and uwsgi for wsgi apps
    pub fn socket_path(&self, app: &str) -> PathBuf {
        self.paths.nginx().join(format!("{}.sock", app))
    }
}

/// Host names from `NGINX_SERVER_NAME`
pub fn server_names(env: &Env) -> Vec<String> {
    env.get("NGINX_SERVER_NAME")
        .map(|names| {
            names
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve the static mappings for an app checked out at `src`.
///
/// `NGINX_STATIC_PATHS` wins over a `static` worker; with neither there are
/// no mappings.
pub fn static_paths(
    src: &Path,
    env: &Env,
    workers: &Procfile,
) -> Result<Vec<StaticMapping>, ProxyConfigError> {
    if let Some(spec) = env.get("NGINX_STATIC_PATHS").filter(|s| !s.trim().is_empty()) {
        let mut mappings = Vec::new();
        for item in spec.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (url, dir) = item
                .split_once(':')
                .ok_or_else(|| ProxyConfigError::InvalidStaticPath(item.to_string()))?;
            let (url, dir) = (url.trim(), dir.trim());
            if url.is_empty() || dir.is_empty() {
                return Err(ProxyConfigError::InvalidStaticPath(item.to_string()));
            }
            mappings.push(StaticMapping {
                url: url.to_string(),
                path: resolve(src, dir),
            });
        }
        return Ok(mappings);
    }

    if workers.contains("static") {
        let dir = workers.get("static").trim().trim_matches('/');
        let path = if dir.is_empty() {
            src.to_path_buf()
        } else {
            src.join(dir)
        };
        return Ok(vec![StaticMapping {
            url: "/".to_string(),
            path,
        }]);
    }

    Ok(Vec::new())
}

fn resolve(src: &Path, dir: &str) -> PathBuf {
    if dir.starts_with('/') {
        PathBuf::from(dir)
    } else {
        src.join(dir.trim_end_matches('/'))
    }
}

struct CacheSettings {
    path: PathBuf,
    prefixes: String,
    size_gb: i64,
    control_secs: i64,
    content_secs: i64,
    redirects_secs: i64,
    any_secs: i64,
    expiry_secs: i64,
}

impl CacheSettings {
    fn from_env(env: &Env, prefixes: &str, default_path: &Path) -> Self {
        let number = |key: &str, default: i64| match env.get_int(key, default) {
            Ok(value) if value >= 0 => value,
            _ => {
                warn!(variable = key, default, "Invalid cache setting, using default");
                default
            }
        };

        let path = match env.get("NGINX_CACHE_PATH") {
            Some(custom) if Path::new(custom).is_dir() => PathBuf::from(custom),
            Some(custom) => {
                warn!(path = %custom, "NGINX_CACHE_PATH does not exist, using default cache path");
                default_path.to_path_buf()
            }
            None => default_path.to_path_buf(),
        };

        Self {
            path,
            prefixes: prefixes
                .split(',')
                .map(|p| p.trim().trim_start_matches('/'))
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join("|"),
            size_gb: number("NGINX_CACHE_SIZE", 1),
            control_secs: number("NGINX_CACHE_CONTROL", 3600),
            content_secs: number("NGINX_CACHE_TIME", 3600),
            redirects_secs: number("NGINX_CACHE_REDIRECTS", 3600),
            any_secs: number("NGINX_CACHE_ANY", 3600),
            expiry_secs: number("NGINX_CACHE_EXPIRY", 86400),
        }
    }
}

/// Indented nginx text builder
#[derive(Default)]
struct Writer {
    buf: String,
    depth: usize,
}

impl Writer {
    fn line(&mut self, text: &str) {
        if !text.is_empty() {
            for _ in 0..self.depth {
                self.buf.push_str("  ");
            }
            self.buf.push_str(text);
        }
        self.buf.push('\n');
    }

    fn open(&mut self, header: &str) {
        self.line(&format!("{} {{", header));
        self.depth += 1;
    }

    fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.line("}");
    }

    /// Insert a multi-line block at the current depth
    fn raw(&mut self, text: &str) {
        for line in text.lines() {
            self.line(line.trim_end());
        }
    }
}

struct Site<'a> {
    app: &'a str,
    env: &'a Env,
    nginx_root: PathBuf,
    acme_www: PathBuf,
    ssl_listen: &'a str,
    server_names: &'a [String],
    ipv4: &'a str,
    ipv6: Option<&'a str>,
    /// `uwsgi` or `proxy`
    directive: &'static str,
    upstream: Option<&'a str>,
}

impl Site<'_> {
    fn render(
        &self,
        static_mappings: &[StaticMapping],
        cache: Option<&CacheSettings>,
        custom: Option<&str>,
    ) -> String {
        let mut w = Writer::default();

        if let Some(cache) = cache {
            w.line(&format!(
                "{}_cache_path {} levels=1:2 keys_zone={}:20m inactive={}s max_size={}g use_temp_path=off;",
                self.directive,
                cache.path.display(),
                self.app,
                cache.expiry_secs,
                cache.size_gb
            ));
        }
        if let Some(target) = self.upstream {
            w.open(&format!("upstream {}", self.app));
            w.line(&format!("server {};", target));
            w.close();
        }

        let https_only = self.env.get_bool("NGINX_HTTPS_ONLY", false);
        w.open("server");
        self.listen(&mut w, "80");
        if https_only {
            w.line(&format!("server_name {};", self.server_names.join(" ")));
        }
        self.acme_location(&mut w);
        if https_only {
            w.open("location /");
            w.line("return 301 https://$server_name$request_uri;");
            w.close();
            w.close();
            w.line("");
            w.open("server");
        }
        self.common(&mut w, static_mappings, cache, custom);
        w.close();

        w.buf
    }

    fn listen(&self, w: &mut Writer, port: &str) {
        if let Some(ipv6) = self.ipv6 {
            w.line(&format!("listen {}:{};", ipv6, port));
        }
        w.line(&format!("listen {}:{};", self.ipv4, port));
    }

    fn acme_location(&self, w: &mut Writer) {
        w.open("location ^~ /.well-known/acme-challenge");
        w.line("allow all;");
        w.line(&format!("root {};", self.acme_www.display()));
        w.close();
    }

    fn common(
        &self,
        w: &mut Writer,
        static_mappings: &[StaticMapping],
        cache: Option<&CacheSettings>,
        custom: Option<&str>,
    ) {
        self.listen(w, self.ssl_listen);
        w.line(&format!(
            "ssl_certificate {};",
            self.nginx_root.join(format!("{}.crt", self.app)).display()
        ));
        w.line(&format!(
            "ssl_certificate_key {};",
            self.nginx_root.join(format!("{}.key", self.app)).display()
        ));
        w.line(&format!("server_name {};", self.server_names.join(" ")));
        w.line("");
        w.line("gzip on;");
        w.line("gzip_proxied any;");
        w.line(&format!("gzip_types {};", GZIP_TYPES));
        w.line("gzip_comp_level 7;");
        w.line("gzip_min_length 2048;");
        w.line("gzip_vary on;");
        w.line("gzip_disable \"MSIE [1-6]\\.(?!.*SV1)\";");
        w.line("add_header X-Deployed-By Launchpad;");

        if let Some(custom) = custom {
            w.line("");
            w.raw(custom);
        }

        for mapping in static_mappings {
            info!(app = %self.app, url = %mapping.url, path = %mapping.path.display(), "nginx will serve static files");
            w.line("");
            w.open(&format!("location {}", mapping.url));
            w.line("sendfile on;");
            w.line("sendfile_max_chunk 1m;");
            w.line("tcp_nopush on;");
            w.line("directio 8m;");
            w.line("aio threads;");
            w.line(&format!("alias {}/;", mapping.path.display()));
            w.line("try_files $uri $uri.html /index.html =404;");
            w.close();
        }

        if let Some(cache) = cache {
            let d = self.directive;
            w.line("");
            w.open(&format!("location ~* ^/({})", cache.prefixes));
            w.line(&format!("{}_cache {};", d, self.app));
            w.line(&format!("{}_cache_min_uses 1;", d));
            w.line(&format!("{}_cache_key $host$uri;", d));
            w.line(&format!("{}_cache_valid 200 304 {}s;", d, cache.content_secs));
            w.line(&format!("{}_cache_valid 301 307 {}s;", d, cache.redirects_secs));
            w.line(&format!("{}_cache_valid 500 502 503 504 0s;", d));
            w.line(&format!("{}_cache_valid any {}s;", d, cache.any_secs));
            w.line(&format!("{}_hide_header Cache-Control;", d));
            w.line(&format!(
                "add_header Cache-Control \"public, max-age={}\";",
                cache.control_secs
            ));
            w.line("add_header X-Cache $upstream_cache_status;");
            self.pass(w);
            w.close();
        }

        if !self.env.get_bool("NGINX_ALLOW_GIT_FOLDERS", false) {
            w.line("");
            w.line("location ~ /\\.git { deny all; }");
        }

        if self.upstream.is_some() {
            w.line("");
            w.open("location /");
            self.pass(w);
            if let Some(acl) = self.env.get("NGINX_ACL").filter(|a| !a.is_empty()) {
                w.line(acl);
            }
            w.close();
        }
    }

    fn pass(&self, w: &mut Writer) {
        if self.directive == "uwsgi" {
            w.line(&format!("uwsgi_pass {};", self.app));
            for (param, value) in UWSGI_PARAMS {
                w.line(&format!("uwsgi_param {} {};", param, value));
            }
        } else {
            w.line(&format!("proxy_pass http://{};", self.app));
            w.line("proxy_http_version 1.1;");
            for (header, value) in PROXY_HEADERS {
                w.line(&format!("proxy_set_header {} {};", header, value));
            }
        }
    }
}
