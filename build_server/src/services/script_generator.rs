//! Build script synthesis.
//!
//! `plan` maps a project type and its build configuration onto install/build
//! commands and an output convention; `generate` renders the plan into the
//! POSIX shell script the sandbox runs. Both are pure: identical inputs give
//! byte-identical output.

use crate::error::{BuildError, Result};
use crate::models::project::{
    BuildConfig, NodeTool, ProjectType, PythonFramework, PythonTool,
};
use crate::models::{ArtifactKind, BuildRequest};

use super::cache_service::CacheLane;

/// Echoed as the last line of a successful script.
pub const SUCCESS_SENTINEL: &str = "__SHIPYARD_BUILD_SUCCEEDED__";

/// Exit code for an unreachable repository or missing branch.
pub const CLONE_FAILED_EXIT: i64 = 20;
/// Exit code when the pinned commit cannot be fetched or checked out.
pub const CHECKOUT_FAILED_EXIT: i64 = 21;
/// Exit code of a bounded sub-step that ran out of time (coreutils `timeout`).
pub const STEP_TIMEOUT_EXIT: i64 = 124;
/// Exit of a step stopped by SIGTERM; busybox `timeout` reports this instead of 124.
pub const SIGTERM_EXIT: i64 = 143;

pub const WORKSPACE_MOUNT: &str = "/workspace";
pub const SOURCE_DIR: &str = "/workspace/src";
pub const OUTPUT_DIR: &str = "/workspace/output";
pub const CACHE_DIR: &str = "/workspace/cache";
/// Read-only mount point for local repositories.
pub const LOCAL_SOURCE_MOUNT: &str = "/source";

const MANIFEST_EOF: &str = "SHIPYARD_MANIFEST_EOF";

/// Bounds for the clone and fetch/checkout sub-steps, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepLimits {
    pub clone_secs: u64,
    pub checkout_secs: u64,
}

impl Default for StepLimits {
    fn default() -> Self {
        Self {
            clone_secs: 120,
            checkout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputPlan {
    /// Copy one directory of the built tree.
    Directory(String),
    /// Copy the whole source tree (minus `.git`).
    SourceTree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub install: Option<String>,
    pub build: Option<String>,
    pub output: OutputPlan,
    /// Synthesized container manifest for backend types.
    pub manifest: Option<String>,
    pub cache_lanes: Vec<CacheLane>,
    pub artifact_kind: ArtifactKind,
}

impl BuildPlan {
    /// Whether the sandbox needs egress to run this plan for `request`.
    pub fn needs_network(&self, request: &BuildRequest) -> bool {
        request.local_source().is_none()
            || self.install.is_some()
            || request.project_type.is_backend()
    }
}

/// Select commands and output convention for a project.
pub fn plan(project_type: &ProjectType, config: &BuildConfig) -> Result<BuildPlan> {
    let cache_lanes = CacheLane::for_project(project_type);

    let plan = match project_type {
        ProjectType::Static => BuildPlan {
            install: None,
            build: None,
            output: OutputPlan::SourceTree,
            manifest: None,
            cache_lanes,
            artifact_kind: ArtifactKind::StaticSite,
        },
        ProjectType::NodeFrontend { framework, tool } => {
            let output = config
                .output_directory()
                .unwrap_or(framework.output_dir())
                .to_string();
            BuildPlan {
                install: Some(
                    config
                        .install_command()
                        .map(str::to_string)
                        .unwrap_or_else(|| frontend_install(*tool)),
                ),
                build: Some(
                    config
                        .build_command()
                        .map(str::to_string)
                        .unwrap_or_else(|| tool.run_script("build")),
                ),
                output: OutputPlan::Directory(validate_output_dir(&output)?),
                manifest: None,
                cache_lanes,
                artifact_kind: ArtifactKind::StaticSite,
            }
        }
        ProjectType::NodeBackend { tool } => {
            let start = config
                .start_command()
                .map(str::to_string)
                .unwrap_or_else(|| tool.run_script("start"));
            BuildPlan {
                install: Some(
                    config
                        .install_command()
                        .map(str::to_string)
                        .unwrap_or_else(|| backend_install(*tool)),
                ),
                build: config.build_command().map(str::to_string),
                output: OutputPlan::SourceTree,
                manifest: Some(node_manifest(config.node_version(), &start)),
                cache_lanes,
                artifact_kind: ArtifactKind::ContainerContext,
            }
        }
        ProjectType::Python { framework, tool } => {
            let build = match framework {
                PythonFramework::Django => {
                    Some("python manage.py collectstatic --noinput".to_string())
                }
                PythonFramework::Flask | PythonFramework::Plain => None,
            };
            let launch = config
                .start_command()
                .map(str::to_string)
                .unwrap_or_else(|| python_launch(*framework).to_string());
            BuildPlan {
                install: Some(
                    config
                        .install_command()
                        .map(str::to_string)
                        .unwrap_or_else(|| python_install(*tool).to_string()),
                ),
                build: config.build_command().map(str::to_string).or(build),
                output: OutputPlan::SourceTree,
                manifest: Some(python_manifest(config.python_version(), *tool, &launch)),
                cache_lanes,
                artifact_kind: ArtifactKind::ContainerContext,
            }
        }
        ProjectType::Unrecognized { language } => {
            let build = config.build_command().ok_or_else(|| {
                BuildError::Configuration(format!(
                    "unsupported project type ({}) without a declared build command",
                    language.as_deref().unwrap_or("unknown")
                ))
            })?;
            let output = config.output_directory().unwrap_or("dist");
            BuildPlan {
                install: config.install_command().map(str::to_string),
                build: Some(build.to_string()),
                output: OutputPlan::Directory(validate_output_dir(output)?),
                manifest: None,
                cache_lanes,
                artifact_kind: ArtifactKind::StaticSite,
            }
        }
    };
    Ok(plan)
}

/// Render the full build script for `request`.
pub fn generate(request: &BuildRequest, limits: StepLimits) -> Result<String> {
    let plan = plan(&request.project_type, &request.build_config)?;
    Ok(render(request, &plan, limits))
}

/// Render an already computed plan.
pub fn render(request: &BuildRequest, plan: &BuildPlan, limits: StepLimits) -> String {
    let mut s = Script::default();

    s.line("#!/bin/sh");
    s.line(format!(
        "# Generated by shipyard-build for a {} project.",
        request.project_type.label()
    ));
    s.line("set -eu");
    s.blank();
    s.line("run_bounded() {");
    s.line("  limit=\"$1\"");
    s.line("  shift");
    s.line("  rc=0");
    s.line("  timeout \"$limit\" \"$@\" || rc=$?");
    s.line(format!(
        "  if [ \"$rc\" -eq {STEP_TIMEOUT_EXIT} ] || [ \"$rc\" -eq {SIGTERM_EXIT} ]; then"
    ));
    s.line("    echo \"error: timed out after ${limit}s: $*\" >&2");
    s.line(format!("    exit {STEP_TIMEOUT_EXIT}"));
    s.line("  fi");
    s.line("  return \"$rc\"");
    s.line("}");
    s.blank();

    render_clone(&mut s, request, limits);
    render_cache_restore(&mut s, &plan.cache_lanes);

    if let Some(install) = &plan.install {
        s.line("echo \"==> Installing dependencies\"");
        s.line(install);
        s.blank();
    }
    if let Some(build) = &plan.build {
        s.line("echo \"==> Building\"");
        s.line(build);
        s.blank();
    }

    render_output(&mut s, plan);
    render_cache_save(&mut s, &plan.cache_lanes);

    s.line("echo \"Build completed\"");
    s.line(format!("echo \"{SUCCESS_SENTINEL}\""));
    s.finish()
}

fn render_clone(s: &mut Script, request: &BuildRequest, limits: StepLimits) {
    let branch = quote(&request.branch);
    let clone_fail = format!(
        "{{ echo \"error: could not clone {} ({})\" >&2; exit {CLONE_FAILED_EXIT}; }}",
        escape_dq(&request.repository),
        escape_dq(&request.branch)
    );

    s.line("echo \"==> Cloning repository\"");
    s.line(format!("rm -rf {SOURCE_DIR}"));

    if request.local_source().is_some() {
        s.line(format!(
            "if command -v git >/dev/null 2>&1 && [ -d {LOCAL_SOURCE_MOUNT}/.git ]; then"
        ));
        s.line(format!(
            "  run_bounded {} git clone --depth 1 --branch {branch} file://{LOCAL_SOURCE_MOUNT} {SOURCE_DIR} || {clone_fail}",
            limits.clone_secs
        ));
        s.line("else");
        s.line(format!(
            "  mkdir -p {SOURCE_DIR} && cp -a {LOCAL_SOURCE_MOUNT}/. {SOURCE_DIR}/ || {clone_fail}"
        ));
        s.line("fi");
    } else {
        s.line("if ! command -v git >/dev/null 2>&1; then");
        s.line("  if command -v apk >/dev/null 2>&1; then");
        s.line("    apk add --no-cache git >/dev/null");
        s.line("  elif command -v apt-get >/dev/null 2>&1; then");
        s.line("    apt-get update -qq >/dev/null && apt-get install -y -qq --no-install-recommends git ca-certificates >/dev/null");
        s.line("  fi");
        s.line("fi");
        s.line(format!(
            "run_bounded {} git clone --depth 1 --branch {branch} {} {SOURCE_DIR} || {clone_fail}",
            limits.clone_secs,
            quote(&request.repository)
        ));
    }
    s.line(format!("cd {SOURCE_DIR}"));

    if let Some(commit) = request.pinned_commit() {
        let checkout_fail = format!(
            "{{ echo \"error: commit {} not found\" >&2; exit {CHECKOUT_FAILED_EXIT}; }}",
            escape_dq(commit)
        );
        s.line("if [ -d .git ]; then");
        s.line("  case \"$(git rev-parse HEAD)\" in");
        s.line(format!("    {}*) ;;", quote(commit)));
        s.line("    *)");
        s.line(format!(
            "      echo \"==> Fetching commit {}\"",
            escape_dq(commit)
        ));
        s.line(format!(
            "      run_bounded {} git fetch --depth 1 origin {} || {checkout_fail}",
            limits.checkout_secs,
            quote(commit)
        ));
        s.line(format!(
            "      git checkout --quiet FETCH_HEAD || {checkout_fail}"
        ));
        s.line("      ;;");
        s.line("  esac");
        s.line("fi");
    }
    s.blank();
}

fn render_cache_restore(s: &mut Script, lanes: &[CacheLane]) {
    if lanes.is_empty() {
        return;
    }
    s.line("echo \"==> Restoring cache\"");
    s.line(format!("mkdir -p {CACHE_DIR}"));
    for lane in lanes {
        let cached = format!("{CACHE_DIR}/{}", lane.dir_name());
        match lane {
            CacheLane::NodeModules => {
                s.line(format!("if [ -d {cached} ] && [ ! -d node_modules ]; then"));
                s.line(format!("  mv {cached} ./node_modules"));
                s.line("  echo \"cache: restored node_modules\"");
                s.line("else");
                s.line("  echo \"cache: node_modules not cached\"");
                s.line("fi");
            }
            CacheLane::PipPackages => {
                s.line(format!("mkdir -p {cached}"));
                s.line(format!("export PIP_CACHE_DIR={cached}"));
                s.line("echo \"cache: pip cache at $PIP_CACHE_DIR\"");
            }
        }
    }
    s.blank();
}

fn render_output(s: &mut Script, plan: &BuildPlan) {
    s.line("echo \"==> Copying output\"");
    s.line(format!("rm -rf {OUTPUT_DIR}"));
    s.line(format!("mkdir -p {OUTPUT_DIR}"));
    match &plan.output {
        OutputPlan::Directory(dir) => {
            let quoted = quote(dir);
            s.line(format!("if [ ! -d {quoted} ]; then"));
            s.line(format!(
                "  echo \"error: output directory {} not found\" >&2",
                escape_dq(dir)
            ));
            s.line("  exit 1");
            s.line("fi");
            s.line(format!("cp -a {quoted}/. {OUTPUT_DIR}/"));
        }
        OutputPlan::SourceTree => {
            s.line(format!("cp -a ./. {OUTPUT_DIR}/"));
            s.line(format!("rm -rf {OUTPUT_DIR}/.git"));
        }
    }
    if let Some(manifest) = &plan.manifest {
        s.line(format!("cat > {OUTPUT_DIR}/Dockerfile <<'{MANIFEST_EOF}'"));
        for line in manifest.lines() {
            s.line(line);
        }
        s.line(MANIFEST_EOF);
    }
    s.blank();
}

fn render_cache_save(s: &mut Script, lanes: &[CacheLane]) {
    if lanes.is_empty() {
        return;
    }
    s.line("echo \"==> Saving cache\"");
    for lane in lanes {
        let cached = format!("{CACHE_DIR}/{}", lane.dir_name());
        match lane {
            CacheLane::NodeModules => {
                s.line("if [ -d node_modules ]; then");
                s.line(format!(
                    "  {{ rm -rf {cached} && cp -a node_modules {cached}; }} || echo \"warning: could not save node_modules cache\" >&2"
                ));
                s.line("fi");
            }
            CacheLane::PipPackages => {
                s.line(format!("echo \"cache: pip packages kept in {cached}\""));
            }
        }
    }
    s.blank();
}

fn frontend_install(tool: NodeTool) -> String {
    match tool {
        NodeTool::Npm => "npm install".to_string(),
        NodeTool::Yarn => "yarn install --frozen-lockfile".to_string(),
        NodeTool::Pnpm => "pnpm install --frozen-lockfile".to_string(),
    }
}

fn backend_install(tool: NodeTool) -> String {
    match tool {
        NodeTool::Npm | NodeTool::Yarn => format!("{} install --production", tool.binary()),
        NodeTool::Pnpm => "pnpm install --prod".to_string(),
    }
}

fn python_install(tool: PythonTool) -> &'static str {
    match tool {
        PythonTool::Pip => "pip install -r requirements.txt",
        PythonTool::Pipenv => "pip install pipenv && pipenv install --deploy --system",
        PythonTool::Poetry => {
            "pip install poetry && poetry config virtualenvs.create false && poetry install --no-interaction --no-root"
        }
    }
}

fn python_launch(framework: PythonFramework) -> &'static str {
    match framework {
        PythonFramework::Django => "gunicorn wsgi:application --bind 0.0.0.0:8000",
        PythonFramework::Flask => "gunicorn app:app --bind 0.0.0.0:8000",
        PythonFramework::Plain => "python app.py",
    }
}

fn node_manifest(node_version: &str, start: &str) -> String {
    [
        format!("FROM node:{node_version}-alpine"),
        "WORKDIR /app".to_string(),
        "COPY . .".to_string(),
        "ENV NODE_ENV=production".to_string(),
        "EXPOSE 3000".to_string(),
        format!("CMD [\"sh\", \"-c\", {}]", json_string(start)),
    ]
    .join("\n")
}

fn python_manifest(python_version: &str, tool: PythonTool, launch: &str) -> String {
    [
        format!("FROM python:{python_version}-slim"),
        "WORKDIR /app".to_string(),
        "COPY . .".to_string(),
        format!("RUN {}", python_install(tool).replace("pip install", "pip install --no-cache-dir")),
        "ENV PYTHONUNBUFFERED=1".to_string(),
        "EXPOSE 8000".to_string(),
        format!("CMD [\"sh\", \"-c\", {}]", json_string(launch)),
    ]
    .join("\n")
}

/// Output directories must stay inside the source tree.
fn validate_output_dir(dir: &str) -> Result<String> {
    let trimmed = dir.trim().trim_end_matches('/');
    let escapes = trimmed.starts_with('/')
        || trimmed.split('/').any(|part| part == "..")
        || trimmed.is_empty();
    if escapes {
        return Err(BuildError::Configuration(format!(
            "output directory {dir:?} must be a relative path inside the repository"
        )));
    }
    Ok(trimmed.to_string())
}

/// Single-quote for POSIX sh.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Escape for use inside a double-quoted `echo` argument.
fn escape_dq(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control())
        .flat_map(|c| match c {
            '"' | '\\' | '$' | '`' => vec!['\\', c],
            _ => vec![c],
        })
        .collect()
}

fn json_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[derive(Default)]
struct Script {
    text: String,
}

impl Script {
    fn line(&mut self, line: impl AsRef<str>) {
        self.text.push_str(line.as_ref());
        self.text.push('\n');
    }

    fn blank(&mut self) {
        self.text.push('\n');
    }

    fn finish(self) -> String {
        self.text
    }
}
