//! Project descriptors: the detected project type and its build configuration.
//!
//! Both are sourced from the project entity and never mutated by the engine.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeTool {
    Npm,
    Yarn,
    Pnpm,
}

impl NodeTool {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "npm" => Some(Self::Npm),
            "yarn" => Some(Self::Yarn),
            "pnpm" => Some(Self::Pnpm),
            _ => None,
        }
    }

    pub fn binary(self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Yarn => "yarn",
            Self::Pnpm => "pnpm",
        }
    }

    /// Invocation of a package.json script (`npm run build`, `yarn build`, ...).
    pub fn run_script(self, script: &str) -> String {
        match self {
            Self::Npm => format!("npm run {script}"),
            Self::Yarn => format!("yarn {script}"),
            Self::Pnpm => format!("pnpm {script}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PythonTool {
    Pip,
    Pipenv,
    Poetry,
}

impl PythonTool {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pip" => Some(Self::Pip),
            "pipenv" => Some(Self::Pipenv),
            "poetry" => Some(Self::Poetry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontendFramework {
    React,
    Vue,
    Angular,
    NextJs,
}

impl FrontendFramework {
    /// Directory the framework's production build writes to.
    pub fn output_dir(self) -> &'static str {
        match self {
            Self::React => "build",
            Self::NextJs => ".next",
            Self::Vue | Self::Angular => "dist",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PythonFramework {
    Plain,
    Django,
    Flask,
}

/// Closed set of project types the engine knows how to build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProjectType {
    Static,
    NodeFrontend {
        framework: FrontendFramework,
        tool: NodeTool,
    },
    NodeBackend {
        tool: NodeTool,
    },
    Python {
        framework: PythonFramework,
        tool: PythonTool,
    },
    Unrecognized {
        language: Option<String>,
    },
}

impl ProjectType {
    /// Map the loose descriptor produced by project detection onto the closed type.
    ///
    /// `kind` is the project's declared type (`react`, `django`, `nodejs`, ...)
    /// and `build_tool` the detected package manager.
    pub fn from_descriptor(kind: &str, build_tool: Option<&str>) -> Self {
        let node_tool = build_tool.and_then(NodeTool::from_name).unwrap_or(NodeTool::Npm);
        let python_tool = build_tool
            .and_then(PythonTool::from_name)
            .unwrap_or(PythonTool::Pip);

        let frontend = |framework| Self::NodeFrontend {
            framework,
            tool: node_tool,
        };
        let python = |framework| Self::Python {
            framework,
            tool: python_tool,
        };

        match kind.trim().to_ascii_lowercase().as_str() {
            "static" | "html" => Self::Static,
            "react" => frontend(FrontendFramework::React),
            "vue" => frontend(FrontendFramework::Vue),
            "angular" => frontend(FrontendFramework::Angular),
            "nextjs" | "next" => frontend(FrontendFramework::NextJs),
            "nodejs" | "node" | "express" => Self::NodeBackend { tool: node_tool },
            "python" => python(PythonFramework::Plain),
            "django" => python(PythonFramework::Django),
            "flask" => python(PythonFramework::Flask),
            "" | "other" => Self::Unrecognized { language: None },
            other => Self::Unrecognized {
                language: Some(other.to_string()),
            },
        }
    }

    /// Short label used for logs, metrics and cache keys.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::NodeFrontend { .. } => "node-frontend",
            Self::NodeBackend { .. } => "node-backend",
            Self::Python { .. } => "python",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }

    /// Backend types ship as container images and may call out during build.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::NodeBackend { .. } | Self::Python { .. })
    }
}

/// A project environment variable as stored by the project configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub secret: bool,
}

/// Prefixes frameworks use for variables deliberately exposed to the client bundle.
pub const PUBLIC_ENV_PREFIXES: &[&str] = &[
    "REACT_APP_",
    "NEXT_PUBLIC_",
    "VUE_APP_",
    "VITE_",
    "NG_APP_",
    "PUBLIC_",
];

impl EnvVar {
    pub fn is_public(&self) -> bool {
        PUBLIC_ENV_PREFIXES
            .iter()
            .any(|prefix| self.key.starts_with(prefix))
    }

    /// Secret variables are withheld unless they follow a public-exposure convention.
    pub fn injectable(&self) -> bool {
        !self.secret || self.is_public()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub output_directory: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub node_version: Option<String>,
    #[serde(default)]
    pub python_version: Option<String>,
    #[serde(default)]
    pub environment: Vec<EnvVar>,
}

pub const DEFAULT_NODE_VERSION: &str = "18";
pub const DEFAULT_PYTHON_VERSION: &str = "3.9";

impl BuildConfig {
    /// Variables injected into the execution environment.
    pub fn injectable_env(&self) -> impl Iterator<Item = &EnvVar> {
        self.environment.iter().filter(|var| var.injectable())
    }

    pub fn node_version(&self) -> &str {
        non_empty(&self.node_version).unwrap_or(DEFAULT_NODE_VERSION)
    }

    pub fn python_version(&self) -> &str {
        non_empty(&self.python_version).unwrap_or(DEFAULT_PYTHON_VERSION)
    }

    pub fn install_command(&self) -> Option<&str> {
        non_empty(&self.install_command)
    }

    pub fn build_command(&self) -> Option<&str> {
        non_empty(&self.build_command)
    }

    pub fn output_directory(&self) -> Option<&str> {
        non_empty(&self.output_directory)
    }

    pub fn start_command(&self) -> Option<&str> {
        non_empty(&self.start_command)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
