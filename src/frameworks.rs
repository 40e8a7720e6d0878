//! Framework registry: turns a bag of generated files into a deployable
//! project by identifying the framework, enforcing the files and
//! dependencies its build needs, and recording a canonical
//! `nimbus.config.json` the sandbox and deploy drivers read.
//!
//! Each framework is a plain value; the registry is a static ordered list
//! and priority is insertion order.

use serde_json::Value;

use crate::models::{DeployTarget, GeneratedFile, NimbusConfig};

#[derive(Debug, Clone, Copy, Default)]
pub struct TargetOutputs {
    pub assets_dir: Option<&'static str>,
    pub worker_entry: Option<&'static str>,
}

pub struct Framework {
    pub id: &'static str,
    pub default_target: DeployTarget,
    pub supported_targets: &'static [DeployTarget],
    pub prompt_keywords: &'static [&'static str],
    detector: fn(&ProjectView<'_>) -> bool,
    normalizer: Option<fn(&mut Vec<GeneratedFile>, DeployTarget)>,
    added_dependencies: fn(DeployTarget) -> &'static [(&'static str, &'static str)],
    added_dev_dependencies: fn(DeployTarget) -> &'static [(&'static str, &'static str)],
    outputs: fn(DeployTarget) -> TargetOutputs,
    prompt_rules: fn(DeployTarget) -> &'static str,
}

impl Framework {
    pub fn supports(&self, target: DeployTarget) -> bool {
        self.supported_targets.contains(&target)
    }

    pub fn outputs(&self, target: DeployTarget) -> TargetOutputs {
        (self.outputs)(target)
    }
}

/// Cheap read-only view over the generated tree used by detectors.
struct ProjectView<'a> {
    files: &'a [GeneratedFile],
    package_json: Option<Value>,
}

impl<'a> ProjectView<'a> {
    fn new(files: &'a [GeneratedFile]) -> Self {
        let package_json = find_file(files, "package.json")
            .and_then(|f| serde_json::from_str(&f.content).ok());
        Self { files, package_json }
    }

    fn has_dependency(&self, name: &str) -> bool {
        let Some(pkg) = &self.package_json else {
            return false;
        };
        for section in ["dependencies", "devDependencies"] {
            if pkg
                .get(section)
                .and_then(|d| d.get(name))
                .is_some()
            {
                return true;
            }
        }
        false
    }

    fn has_file(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }
}

pub fn find_file<'a>(files: &'a [GeneratedFile], path: &str) -> Option<&'a GeneratedFile> {
    files.iter().find(|f| f.path == path)
}

fn upsert_file(files: &mut Vec<GeneratedFile>, path: &str, content: String) {
    match files.iter_mut().find(|f| f.path == path) {
        Some(existing) => existing.content = content,
        None => files.push(GeneratedFile {
            path: path.to_string(),
            content,
        }),
    }
}

// ── Registry ──────────────────────────────────────────────────────────

const NO_DEPS: &[(&str, &str)] = &[];

static REGISTRY: [Framework; 3] = [
    Framework {
        id: "next",
        default_target: DeployTarget::Workers,
        supported_targets: &[DeployTarget::Workers],
        prompt_keywords: &["next.js", "nextjs", "next js"],
        detector: |view| {
            view.has_dependency("next")
                || view.has_file("next.config.js")
                || view.has_file("next.config.mjs")
                || view.has_file("next.config.ts")
        },
        normalizer: Some(normalize_next),
        added_dependencies: |_| NO_DEPS,
        added_dev_dependencies: |_| &[("@opennextjs/cloudflare", "latest"), ("wrangler", "latest")],
        outputs: |_| TargetOutputs {
            assets_dir: Some(".open-next/assets"),
            worker_entry: Some(".open-next/worker.js"),
        },
        prompt_rules: |_| NEXT_WORKERS_RULES,
    },
    Framework {
        id: "astro",
        default_target: DeployTarget::Static,
        supported_targets: &[DeployTarget::Static, DeployTarget::Workers],
        prompt_keywords: &["astro"],
        detector: |view| view.has_dependency("astro") || view.has_file("astro.config.mjs"),
        normalizer: Some(normalize_astro),
        added_dependencies: |target| match target {
            DeployTarget::Workers => &[("astro", "latest"), ("@astrojs/cloudflare", "latest")],
            DeployTarget::Static => &[("astro", "latest")],
        },
        added_dev_dependencies: |_| NO_DEPS,
        outputs: |target| match target {
            DeployTarget::Static => TargetOutputs {
                assets_dir: Some("dist"),
                worker_entry: None,
            },
            DeployTarget::Workers => TargetOutputs {
                assets_dir: Some("dist"),
                worker_entry: Some("dist/_worker.js/index.js"),
            },
        },
        prompt_rules: |target| match target {
            DeployTarget::Static => ASTRO_STATIC_RULES,
            DeployTarget::Workers => ASTRO_WORKERS_RULES,
        },
    },
    Framework {
        id: "vite",
        default_target: DeployTarget::Static,
        supported_targets: &[DeployTarget::Static],
        prompt_keywords: &["vite", "react app", "single page app"],
        detector: |view| {
            view.has_dependency("vite")
                || view.has_file("vite.config.js")
                || view.has_file("vite.config.ts")
                || view.has_file("vite.config.mjs")
        },
        normalizer: None,
        added_dependencies: |_| NO_DEPS,
        added_dev_dependencies: |_| NO_DEPS,
        outputs: |_| TargetOutputs {
            assets_dir: Some("dist"),
            worker_entry: None,
        },
        prompt_rules: |_| VITE_STATIC_RULES,
    },
];

pub fn registry() -> &'static [Framework] {
    &REGISTRY
}

pub fn find_by_id(id: &str) -> Option<&'static Framework> {
    REGISTRY.iter().find(|f| f.id == id)
}

// ── Resolution ────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
pub struct Resolution {
    pub framework: Option<&'static Framework>,
    pub target: DeployTarget,
}

/// Parse `nimbus.config.json` out of the generated tree. Missing or
/// unparseable means "unspecified".
pub fn read_nimbus_config(files: &[GeneratedFile]) -> NimbusConfig {
    find_file(files, NimbusConfig::FILE_NAME)
        .and_then(|f| serde_json::from_str(&f.content).ok())
        .unwrap_or_default()
}

/// Resolve the framework and target for a generated tree. An explicit
/// `config.framework` naming a known framework wins over detection;
/// otherwise the first detector hit in registry order wins; otherwise the
/// project is a plain static site.
pub fn resolve(files: &[GeneratedFile]) -> Resolution {
    let declared = read_nimbus_config(files);
    let view = ProjectView::new(files);

    let framework = declared
        .framework
        .as_deref()
        .and_then(find_by_id)
        .or_else(|| REGISTRY.iter().find(|f| (f.detector)(&view)));

    let target = match framework {
        Some(f) => match declared.target {
            Some(t) if f.supports(t) => t,
            _ => f.default_target,
        },
        None => declared.target.unwrap_or(DeployTarget::Static),
    };

    Resolution { framework, target }
}

/// Rewrite the generated tree in place so it builds and deploys:
/// merge framework dependencies into `package.json`, run the framework's
/// file normalizer, and write the canonical `nimbus.config.json`.
/// Idempotent: running it on its own output produces identical files.
pub fn normalize(files: &mut Vec<GeneratedFile>, resolution: &Resolution) -> NimbusConfig {
    let declared = read_nimbus_config(files);

    if let Some(fw) = resolution.framework {
        inject_dependencies(files, fw, resolution.target);
        if let Some(normalizer) = fw.normalizer {
            normalizer(files, resolution.target);
        }
    }

    let outputs = resolution
        .framework
        .map(|f| f.outputs(resolution.target))
        .unwrap_or_default();

    let config = NimbusConfig {
        framework: resolution.framework.map(|f| f.id.to_string()),
        target: Some(resolution.target),
        assets_dir: outputs
            .assets_dir
            .map(str::to_string)
            .or(declared.assets_dir),
        worker_entry: outputs
            .worker_entry
            .map(str::to_string)
            .or(declared.worker_entry),
    };

    // to_string_pretty cannot fail for this struct shape.
    let body = serde_json::to_string_pretty(&config).unwrap_or_default();
    upsert_file(files, NimbusConfig::FILE_NAME, format!("{}\n", body));
    config
}

/// Merge the framework's dependency additions into `package.json`,
/// preserving any entries the LLM already emitted. Projects without a
/// `package.json` skip injection entirely.
fn inject_dependencies(files: &mut Vec<GeneratedFile>, fw: &Framework, target: DeployTarget) {
    let Some(existing) = find_file(files, "package.json") else {
        return;
    };
    let Ok(mut pkg) = serde_json::from_str::<Value>(&existing.content) else {
        return;
    };
    if !pkg.is_object() {
        return;
    }

    let sections = [
        ("dependencies", (fw.added_dependencies)(target)),
        ("devDependencies", (fw.added_dev_dependencies)(target)),
    ];
    for (section, additions) in sections {
        if additions.is_empty() {
            continue;
        }
        let map = pkg
            .as_object_mut()
            .and_then(|o| {
                o.entry(section)
                    .or_insert_with(|| Value::Object(Default::default()))
                    .as_object_mut()
            });
        let Some(map) = map else { continue };
        for (name, version) in additions {
            map.entry(name.to_string())
                .or_insert_with(|| Value::String(version.to_string()));
        }
    }

    let body = serde_json::to_string_pretty(&pkg).unwrap_or_default();
    upsert_file(files, "package.json", format!("{}\n", body));
}

// ── File normalizers ──────────────────────────────────────────────────

const NEXT_CONFIG_STANDALONE: &str = r#"/** @type {import('next').NextConfig} */
const nextConfig = {
  output: 'standalone',
};

export default nextConfig;
"#;

const ASTRO_CONFIG_WORKERS: &str = r#"import { defineConfig } from 'astro/config';
import cloudflare from '@astrojs/cloudflare';

export default defineConfig({
  output: 'server',
  adapter: cloudflare(),
});
"#;

/// Next on workers requires standalone output; any config the LLM emitted
/// is replaced wholesale with the canonical one.
fn normalize_next(files: &mut Vec<GeneratedFile>, target: DeployTarget) {
    if target != DeployTarget::Workers {
        return;
    }
    files.retain(|f| {
        !matches!(
            f.path.as_str(),
            "next.config.js" | "next.config.mjs" | "next.config.ts"
        )
    });
    files.push(GeneratedFile {
        path: "next.config.mjs".to_string(),
        content: NEXT_CONFIG_STANDALONE.to_string(),
    });
}

/// Astro on workers needs the cloudflare adapter and server output mode.
fn normalize_astro(files: &mut Vec<GeneratedFile>, target: DeployTarget) {
    if target != DeployTarget::Workers {
        return;
    }
    upsert_file(files, "astro.config.mjs", ASTRO_CONFIG_WORKERS.to_string());
}

// ── Prompt synthesis ──────────────────────────────────────────────────

const STATIC_HINTS: &[&str] = &["ssg", "prerender", "static site"];
const SSR_HINTS: &[&str] = &[
    "ssr",
    "server-rendered",
    "server rendered",
    "full-stack",
    "fullstack",
];

const COMMON_RULES: &str = "General rules:\n\
- Every dependency in package.json must use a real published version or 'latest'.\n\
- File paths are project-relative; never emit absolute paths.\n\
- Do not emit lockfiles, node_modules, or build output.";

const GENERIC_STATIC_RULES: &str = "Build a plain static site: an index.html entry point plus any \
css/js assets it references. No package.json and no build step unless the request requires one.";

const NEXT_WORKERS_RULES: &str = "Build a Next.js app (App Router). Include package.json with \
next, react, and react-dom and a 'build' script running 'next build'. Keep pages server-renderable; \
do not add a custom server or next.config.js (it is managed for you).";

const ASTRO_STATIC_RULES: &str = "Build an Astro site that prerenders to static HTML. Include \
package.json with astro and a 'build' script running 'astro build'. Pages live under src/pages.";

const ASTRO_WORKERS_RULES: &str = "Build a server-rendered Astro app. Include package.json with \
astro and a 'build' script running 'astro build'. Pages live under src/pages and may use request-time \
data; the cloudflare adapter and output mode are managed for you.";

const VITE_STATIC_RULES: &str = "Build a Vite single-page app. Include package.json with vite and \
a 'build' script running 'vite build', an index.html entry point, and sources under src/.";

/// Select zero or one framework from the user prompt and return the system
/// prompt fragment for it. This flows only into the LLM system prompt and
/// has no runtime side effects.
pub fn prompt_rules_for(prompt: &str) -> String {
    let lower = prompt.to_lowercase();
    let framework = REGISTRY
        .iter()
        .find(|f| f.prompt_keywords.iter().any(|k| lower.contains(k)));

    let rules = match framework {
        Some(f) => {
            let mut target = f.default_target;
            if f.supports(DeployTarget::Static) && f.supports(DeployTarget::Workers) {
                if STATIC_HINTS.iter().any(|h| lower.contains(h)) {
                    target = DeployTarget::Static;
                } else if SSR_HINTS.iter().any(|h| lower.contains(h)) {
                    target = DeployTarget::Workers;
                }
            }
            (f.prompt_rules)(target)
        }
        None => GENERIC_STATIC_RULES,
    };

    format!("{}\n\n{}", rules, COMMON_RULES)
}
