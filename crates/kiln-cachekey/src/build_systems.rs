//! The predefined `build-system` command tables, kept as a single pure
//! function/table so autodetection and the `artifact-version` hash factor
//! can both be unit-tested in isolation (design note: "command
//! autodetection").

use std::collections::BTreeMap;

use kiln_core::BuildSteps;

fn steps(configure: &[&str], build: &[&str], install: &[&str]) -> BuildSteps {
    BuildSteps {
        configure: configure.iter().map(|s| s.to_string()).collect(),
        build: build.iter().map(|s| s.to_string()).collect(),
        install: install.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Built-in build-system table, keyed by name. Mirrors the handful of
/// predefined command sets a chunk's `build-system` may name.
pub fn builtin_table() -> BTreeMap<&'static str, BuildSteps> {
    BTreeMap::from([
        ("manual", BuildSteps::default()),
        (
            "autotools",
            steps(
                &["./configure --prefix=\"$PREFIX\""],
                &["make -j\"$MAKEFLAGS\""],
                &["make DESTDIR=\"$DESTDIR\" install"],
            ),
        ),
        (
            "cmake",
            steps(
                &["cmake -DCMAKE_INSTALL_PREFIX=\"$PREFIX\" ."],
                &["make -j\"$MAKEFLAGS\""],
                &["make DESTDIR=\"$DESTDIR\" install"],
            ),
        ),
        (
            "qmake",
            steps(
                &["qmake -makefile PREFIX=\"$PREFIX\""],
                &["make -j\"$MAKEFLAGS\""],
                &["make INSTALL_ROOT=\"$DESTDIR\" install"],
            ),
        ),
        (
            "distutils",
            BuildSteps {
                build: vec!["python setup.py build".to_string()],
                install: vec![
                    "python setup.py install --prefix=\"$PREFIX\" --root=\"$DESTDIR\""
                        .to_string(),
                ],
                ..Default::default()
            },
        ),
        (
            "make",
            steps(&[], &["make -j\"$MAKEFLAGS\""], &["make DESTDIR=\"$DESTDIR\" install"]),
        ),
    ])
}

/// Autodetects a build system from a checked-out file list, following the
/// conventional precedence (configure script beats Makefile beats setup.py).
pub fn autodetect(files: &[String]) -> Option<&'static str> {
    let has = |name: &str| files.iter().any(|f| f == name);
    if has("configure") {
        Some("autotools")
    } else if has("CMakeLists.txt") {
        Some("cmake")
    } else if files.iter().any(|f| f.ends_with(".pro")) {
        Some("qmake")
    } else if has("setup.py") {
        Some("distutils")
    } else if has("Makefile") {
        Some("make")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_autotools_over_make() {
        let files = vec!["configure".to_string(), "Makefile".to_string()];
        assert_eq!(autodetect(&files), Some("autotools"));
    }

    #[test]
    fn falls_back_to_none() {
        assert_eq!(autodetect(&[]), None);
    }
}
