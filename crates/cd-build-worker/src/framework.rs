//! Framework detection and container recipe synthesis (spec §4.3 steps 4-5).
//!
//! Detection is a pure function of directory contents: the same marker
//! files always yield the same profile (spec §8's round-trip property).
//! The catalog below is deliberately small; §9's open question leaves the
//! full catalog to be finalized from runtime requirements, so this covers
//! the obvious entries only and falls back to a generic profile.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// A detected (or assumed) runtime profile for the source tree being built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: &'static str,
    pub runtime_base: &'static str,
    pub build_cmd: &'static str,
    pub start_cmd: &'static str,
    pub default_port: u16,
}

const GENERIC: Profile = Profile {
    name: "generic",
    runtime_base: "debian:bookworm-slim",
    build_cmd: "true",
    start_cmd: "./entrypoint.sh",
    default_port: 8080,
};

/// Marker files in priority order. The first match wins; order matters
/// because some repos carry more than one marker (e.g. a `package.json`
/// alongside a leftover `Gemfile`).
const CATALOG: &[(&str, Profile)] = &[
    (
        "Cargo.toml",
        Profile {
            name: "rust",
            runtime_base: "rust:1-slim-bookworm",
            build_cmd: "cargo build --release",
            start_cmd: "./target/release/app",
            default_port: 8000,
        },
    ),
    (
        "package-lock.json",
        Profile {
            name: "node",
            runtime_base: "node:20-slim",
            build_cmd: "npm ci && npm run build --if-present",
            start_cmd: "npm start",
            default_port: 3000,
        },
    ),
    (
        "package.json",
        Profile {
            name: "node",
            runtime_base: "node:20-slim",
            build_cmd: "npm install && npm run build --if-present",
            start_cmd: "npm start",
            default_port: 3000,
        },
    ),
    (
        "requirements.txt",
        Profile {
            name: "python",
            runtime_base: "python:3.12-slim",
            build_cmd: "pip install --no-cache-dir -r requirements.txt",
            start_cmd: "python main.py",
            default_port: 8000,
        },
    ),
    (
        "go.mod",
        Profile {
            name: "go",
            runtime_base: "golang:1.22-bookworm",
            build_cmd: "go build -o app .",
            start_cmd: "./app",
            default_port: 8080,
        },
    ),
    (
        "pom.xml",
        Profile {
            name: "java-maven",
            runtime_base: "eclipse-temurin:21-jre",
            build_cmd: "mvn -q -DskipTests package",
            start_cmd: "java -jar target/app.jar",
            default_port: 8080,
        },
    ),
];

/// Probes `root` for marker files in priority order. Absence of any
/// signature yields [`GENERIC`].
pub fn detect(root: &Path) -> Profile {
    for (marker, profile) in CATALOG {
        if root.join(marker).is_file() {
            return profile.clone();
        }
    }
    GENERIC
}

/// Returns `true` if the source tree already carries a recipe file, in
/// which case it is used unchanged (spec §4.3 step 5).
pub fn has_existing_recipe(root: &Path) -> bool {
    root.join("Dockerfile").is_file()
}

/// Generates a deterministic Dockerfile from a detected profile. Identical
/// input profile → byte-identical output (spec §4.3, §8 round-trip
/// property).
pub fn synthesize_recipe(profile: &Profile, default_port: Option<u16>) -> String {
    let port = default_port.unwrap_or(profile.default_port);
    format!(
        "FROM {base}\n\
         WORKDIR /app\n\
         COPY . .\n\
         RUN {build}\n\
         EXPOSE {port}\n\
         CMD [\"sh\", \"-c\", \"{start}\"]\n",
        base = profile.runtime_base,
        build = profile.build_cmd,
        port = port,
        start = profile.start_cmd,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn detects_rust_by_cargo_toml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();
        let profile = detect(dir.path());
        assert_eq!(profile.name, "rust");
    }

    #[test]
    fn falls_back_to_generic_when_no_marker_present() {
        let dir = tempfile::tempdir().unwrap();
        let profile = detect(dir.path());
        assert_eq!(profile, GENERIC);
    }

    #[test]
    fn detection_is_pure_same_contents_same_profile() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("go.mod"), "module x").unwrap();
        let first = detect(dir.path());
        let second = detect(dir.path());
        assert_eq!(first, second);
    }

    #[test]
    fn recipe_synthesis_is_deterministic() {
        let profile = detect(Path::new("/nonexistent"));
        let a = synthesize_recipe(&profile, None);
        let b = synthesize_recipe(&profile, None);
        assert_eq!(a, b);
    }

    #[test]
    fn existing_dockerfile_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM scratch").unwrap();
        assert!(has_existing_recipe(dir.path()));
    }
}
