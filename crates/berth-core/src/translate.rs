//! Engine API to external runtime translation.
//!
//! A request is matched against an ordered rule table (first match wins) and
//! turned into a [`CommandSpec`] for the configured runtime program. Requests
//! no rule claims translate to `None`, which the gateway treats as a
//! successful no-op.

use axum::http::Method;
use berth_config::RuntimeConfig;
use serde::Deserialize;

use crate::executor::CommandSpec;
use crate::request::{IncomingRequest, PathPattern};

/// Flags that keep the runtime from verifying signatures.
const SKIP_VERIFY: &str = "--insecure-skip-verify";

/// Errors from translating a request.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("bad parameter: {0}")]
    BadParameter(String),
}

/// The part of a container-create body the runtime cares about.
#[derive(Debug, Default, Deserialize)]
struct RunConfig {
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Hostname", default)]
    hostname: String,
}

/// An image reference as the client sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Append `tag` unless the reference already pins a tag or digest.
    ///
    /// Digest tags (`sha256:...`) are joined with `@`, everything else with `:`.
    pub fn with_tag(self, tag: &str) -> Self {
        if tag.is_empty() || self.has_tag_or_digest() {
            return self;
        }
        let sep = if tag.contains(':') { '@' } else { ':' };
        Self(format!("{}{sep}{tag}", self.0))
    }

    fn has_tag_or_digest(&self) -> bool {
        let last = self.0.rsplit('/').next().unwrap_or(&self.0);
        last.contains(':') || last.contains('@')
    }

    /// The reference with an explicit transport scheme.
    ///
    /// References that already carry a scheme, or live on a registry the
    /// runtime fetches natively, are returned untouched.
    pub fn qualify(&self, config: &RuntimeConfig) -> String {
        if self.0.contains("://") || self.is_native(&config.native_registries) {
            return self.0.clone();
        }
        format!("{}://{}", config.default_scheme, self.0)
    }

    fn is_native(&self, registries: &[String]) -> bool {
        registries.iter().any(|registry| {
            self.0 == *registry
                || self
                    .0
                    .strip_prefix(registry.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy)]
enum MethodFilter {
    Any,
    Delete,
}

impl MethodFilter {
    fn admits(self, method: &Method) -> bool {
        match self {
            MethodFilter::Any => true,
            MethodFilter::Delete => method == Method::DELETE,
        }
    }
}

type BuildFn = fn(&RuntimeTranslator, &IncomingRequest, &[String]) -> Result<Option<Vec<String>>, TranslateError>;

struct Rule {
    name: &'static str,
    method: MethodFilter,
    pattern: PathPattern,
    build: BuildFn,
}

const RULES: &[Rule] = &[
    Rule {
        name: "remove-container",
        method: MethodFilter::Delete,
        pattern: PathPattern::new("/containers/*"),
        build: remove_container,
    },
    Rule {
        name: "remove-image",
        method: MethodFilter::Delete,
        pattern: PathPattern::new("/images/*"),
        build: remove_image,
    },
    Rule {
        name: "run",
        method: MethodFilter::Any,
        pattern: PathPattern::new("/containers/create"),
        build: run,
    },
    Rule {
        name: "list",
        method: MethodFilter::Any,
        pattern: PathPattern::new("/containers/json"),
        build: |_, _, _| Ok(Some(args(["list"]))),
    },
    Rule {
        name: "image-list",
        method: MethodFilter::Any,
        pattern: PathPattern::new("/images/json"),
        build: |_, _, _| Ok(Some(args(["image", "list"]))),
    },
    Rule {
        name: "version",
        method: MethodFilter::Any,
        pattern: PathPattern::new("/version"),
        build: |_, _, _| Ok(Some(args(["version"]))),
    },
    Rule {
        name: "status",
        method: MethodFilter::Any,
        pattern: PathPattern::new("/containers/*/stats"),
        build: |_, _, caps| Ok(Some(args(["status", first(caps)]))),
    },
    Rule {
        name: "fetch",
        method: MethodFilter::Any,
        pattern: PathPattern::new("/images/create"),
        build: fetch,
    },
    Rule {
        name: "enter",
        method: MethodFilter::Any,
        pattern: PathPattern::new("/containers/*/json"),
        build: |t, _, caps| Ok(Some(args(["enter", first(caps), t.config.shell.as_str()]))),
    },
    Rule {
        name: "export",
        method: MethodFilter::Any,
        pattern: PathPattern::new("/images/*/get"),
        build: export,
    },
    Rule {
        name: "cat-manifest",
        method: MethodFilter::Any,
        pattern: PathPattern::new("/images/*/json"),
        build: |_, _, caps| Ok(Some(args(["image", "cat-manifest", first(caps)]))),
    },
];

fn args<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    items.into_iter().map(str::to_string).collect()
}

fn first(caps: &[String]) -> &str {
    caps.first().map(String::as_str).unwrap_or_default()
}

fn remove_container(
    _: &RuntimeTranslator,
    _: &IncomingRequest,
    caps: &[String],
) -> Result<Option<Vec<String>>, TranslateError> {
    let id = first(caps);
    if id == "all" {
        return Ok(Some(args(["gc"])));
    }
    Ok(Some(args(["rm", SKIP_VERIFY, id])))
}

fn remove_image(
    _: &RuntimeTranslator,
    _: &IncomingRequest,
    caps: &[String],
) -> Result<Option<Vec<String>>, TranslateError> {
    Ok(Some(args(["image", "rm", first(caps)])))
}

fn run(
    t: &RuntimeTranslator,
    req: &IncomingRequest,
    _: &[String],
) -> Result<Option<Vec<String>>, TranslateError> {
    let config: RunConfig = serde_json::from_slice(req.body())
        .map_err(|e| TranslateError::BadParameter(format!("cannot decode create body: {e}")))?;
    if config.image.trim().is_empty() {
        return Err(TranslateError::BadParameter("missing image".to_string()));
    }
    if !config.hostname.is_empty() {
        tracing::debug!(hostname = %config.hostname, "hostname is not forwarded to the runtime");
    }

    let target = ImageRef::new(config.image).qualify(&t.config);
    Ok(Some(args([
        "--interactive",
        SKIP_VERIFY,
        "--mds-register=false",
        "run",
        target.as_str(),
    ])))
}

fn fetch(
    t: &RuntimeTranslator,
    req: &IncomingRequest,
    _: &[String],
) -> Result<Option<Vec<String>>, TranslateError> {
    let Some(image) = req.query_value("fromImage").filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let image = ImageRef::new(image).with_tag(req.query_value("tag").unwrap_or_default());
    let target = image.qualify(&t.config);
    Ok(Some(args(["fetch", SKIP_VERIFY, target.as_str()])))
}

fn export(
    _: &RuntimeTranslator,
    _: &IncomingRequest,
    caps: &[String],
) -> Result<Option<Vec<String>>, TranslateError> {
    let id = first(caps);
    // Image names may contain slashes; keep the archive in the working directory.
    let archive = format!("{}.aci", id.replace('/', "_"));
    Ok(Some(args(["image", "export", id, archive.as_str()])))
}

/// Maps Engine API requests onto runtime command lines.
#[derive(Debug, Clone)]
pub struct RuntimeTranslator {
    config: RuntimeConfig,
}

impl RuntimeTranslator {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// The runtime program every command is issued against.
    pub fn program(&self) -> &str {
        &self.config.program
    }

    /// Translate a request; `Ok(None)` means nothing needs to run.
    pub fn translate(&self, req: &IncomingRequest) -> Result<Option<CommandSpec>, TranslateError> {
        for rule in RULES {
            if !rule.method.admits(req.method()) {
                continue;
            }
            let Some(caps) = rule.pattern.captures(req.path()) else {
                continue;
            };

            tracing::debug!(rule = rule.name, path = req.path(), "translation rule matched");
            let spec = (rule.build)(self, req, &caps)?
                .map(|argv| CommandSpec::new(self.config.program.as_str(), argv));
            if spec.is_none() {
                tracing::debug!(rule = rule.name, "rule produced no command");
            }
            return Ok(spec);
        }

        tracing::debug!(method = %req.method(), path = req.path(), "no translation rule matched");
        Ok(None)
    }
}
