//! Kustomize-style rendering. A [`Layer`] is a (filesystem, path) pair that
//! builds into a [`ResourceMap`]; overlays synthesise new layers on top of an
//! existing one through an in-memory filesystem, leaving the on-disk commit
//! tree untouched.
//!
//! The build engine covers the subset of kustomize this controller relies on:
//! `resources` (files and nested kustomizations), `nameSuffix`, and
//! `transformers` with the builtin `ReplacementTransformer`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, ensure, Context as _};
use kube::api::DynamicObject;
use kube::ResourceExt as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::Live;
use crate::resources::ResourceMap;
use crate::util::relative_path;
use crate::vfs::{clean_abs, FileSystem, LayeredFs, MemoryFs};

pub const KUSTOMIZATION_FILE_NAME: &str = "kustomization.yaml";
pub const LOCAL_CONFIG_FILE_NAME: &str = "local-config.yaml";

/// Resources annotated with this are visible to transformers during the
/// build but excluded from the rendered output.
pub const LOCAL_CONFIG_ANNOTATION: &str = "config.kubernetes.io/local-config";

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Kustomization {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_suffix: Option<String>,
}

/// A renderable kustomize layer.
#[derive(Clone, Debug)]
pub struct Layer {
    pub fs: Arc<dyn FileSystem>,
    pub path: PathBuf,
}

impl Layer {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    /// Renders the layer into an ordered resource map. Local-config
    /// resources participate in the build but are dropped from the output.
    pub fn build(&self) -> anyhow::Result<ResourceMap> {
        let path = if self.path.as_os_str().is_empty() {
            Path::new(".")
        } else {
            &self.path
        };
        let dir = self.fs.cleaned_abs(path)?;
        let mut builder = Builder {
            fs: self.fs.as_ref(),
            in_progress: BTreeSet::new(),
        };
        let values = builder.build_dir(&dir)?;

        let mut map = ResourceMap::new();
        for value in values {
            if is_local_config(&value) {
                continue;
            }
            let obj: DynamicObject = serde_json::from_value(value.clone())
                .with_context(|| format!("invalid rendered resource: {value}"))?;
            map.push(obj)?;
        }
        Ok(map)
    }
}

struct Builder<'a> {
    fs: &'a dyn FileSystem,
    in_progress: BTreeSet<PathBuf>,
}

impl Builder<'_> {
    fn build_dir(&mut self, dir: &Path) -> anyhow::Result<Vec<Value>> {
        if !self.in_progress.insert(dir.to_owned()) {
            bail!("kustomization cycle via {}", dir.display());
        }
        let result = self.build_dir_inner(dir);
        self.in_progress.remove(dir);
        result.with_context(|| format!("building {}", dir.display()))
    }

    fn build_dir_inner(&mut self, dir: &Path) -> anyhow::Result<Vec<Value>> {
        let kustomization_path = dir.join(KUSTOMIZATION_FILE_NAME);
        if !self.fs.exists(&kustomization_path) {
            bail!("unable to find {KUSTOMIZATION_FILE_NAME} in {}", dir.display());
        }
        let kustomization: Kustomization =
            serde_yaml::from_slice(&self.fs.read_file(&kustomization_path)?)
                .context("parsing kustomization")?;

        let mut resources = Vec::new();
        for entry in &kustomization.resources {
            resources.extend(self.load_entry(dir, entry)?);
        }

        if let Some(suffix) = &kustomization.name_suffix {
            for resource in &mut resources {
                let name = resource["metadata"]["name"]
                    .as_str()
                    .context("nameSuffix target has no metadata.name")?
                    .to_owned();
                resource["metadata"]["name"] = Value::String(format!("{name}{suffix}"));
            }
        }

        for entry in &kustomization.transformers {
            for transformer in self.load_entry(dir, entry)? {
                apply_transformer(&transformer, &mut resources)?;
            }
        }

        Ok(resources)
    }

    // A resource (or transformer) entry is either a manifest file or a
    // directory holding its own kustomization.
    fn load_entry(&mut self, dir: &Path, entry: &str) -> anyhow::Result<Vec<Value>> {
        let path = clean_abs(&dir.join(entry))?;
        if self.fs.exists(&path.join(KUSTOMIZATION_FILE_NAME)) {
            self.build_dir(&path)
        } else if self.fs.exists(&path) {
            self.parse_manifest(&path)
        } else {
            bail!("resource entry {entry:?} not found under {}", dir.display());
        }
    }

    fn parse_manifest(&self, path: &Path) -> anyhow::Result<Vec<Value>> {
        let bytes = self.fs.read_file(path)?;
        let mut docs = Vec::new();
        for doc in serde_yaml::Deserializer::from_slice(&bytes) {
            let value = Value::deserialize(doc)
                .with_context(|| format!("parsing manifest {}", path.display()))?;
            if value.is_null() {
                continue;
            }
            docs.push(value);
        }
        Ok(docs)
    }
}

pub fn is_local_config(resource: &Value) -> bool {
    resource["metadata"]["annotations"][LOCAL_CONFIG_ANNOTATION] == "true"
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Replacement {
    source: SourceSelector,
    targets: Vec<TargetSelector>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct SourceSelector {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    field_path: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TargetSelector {
    select: SourceSelector,
    #[serde(default)]
    field_paths: Vec<String>,
    #[serde(default)]
    options: Option<FieldOptions>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
struct FieldOptions {
    #[serde(default)]
    delimiter: Option<String>,
    #[serde(default)]
    index: usize,
}

fn apply_transformer(transformer: &Value, resources: &mut Vec<Value>) -> anyhow::Result<()> {
    let kind = transformer["kind"].as_str().unwrap_or_default();
    match kind {
        "ReplacementTransformer" => {
            let replacements: Vec<Replacement> =
                serde_json::from_value(transformer["replacements"].clone())
                    .context("parsing replacements")?;
            for replacement in &replacements {
                apply_replacement(replacement, resources)?;
            }
            Ok(())
        }
        _ => bail!("unsupported transformer kind {kind:?}"),
    }
}

fn apply_replacement(replacement: &Replacement, resources: &mut [Value]) -> anyhow::Result<()> {
    let sources: Vec<&Value> = resources
        .iter()
        .filter(|r| selector_matches(&replacement.source, r))
        .collect();
    ensure!(
        sources.len() == 1,
        "replacement source matched {} resources, expected exactly one",
        sources.len()
    );
    let field_path = replacement
        .source
        .field_path
        .as_deref()
        .unwrap_or("metadata.name");
    let steps = parse_field_path(field_path)?;
    let source_value = get_field(sources[0], &steps)
        .with_context(|| format!("source field {field_path:?} not found"))?
        .clone();

    for target in &replacement.targets {
        let options = target.options.clone().unwrap_or_default();
        for resource in resources
            .iter_mut()
            .filter(|r| selector_matches(&target.select, r))
        {
            for field_path in &target.field_paths {
                let steps = parse_field_path(field_path)?;
                set_field(resource, &steps, &source_value, &options)
                    .with_context(|| format!("replacing {field_path:?}"))?;
            }
        }
    }
    Ok(())
}

fn selector_matches(selector: &SourceSelector, resource: &Value) -> bool {
    let matches = |want: &Option<String>, got: &Value| match want {
        Some(want) => got.as_str() == Some(want.as_str()),
        None => true,
    };
    matches(&selector.kind, &resource["kind"])
        && matches(&selector.name, &resource["metadata"]["name"])
        && matches(&selector.namespace, &resource["metadata"]["namespace"])
}

#[derive(Debug, PartialEq)]
enum Step {
    Key(String),
    // [name=value] list selection
    Filter { key: String, value: String },
    Index(usize),
}

// Splits a field path on dots that aren't inside a [key=value] segment, e.g.
// "spec.containers.[name=app].image".
fn parse_field_path(path: &str) -> anyhow::Result<Vec<Step>> {
    let mut steps = Vec::new();
    let mut segment = String::new();
    let mut in_brackets = false;
    for c in path.chars().chain(std::iter::once('.')) {
        match c {
            '[' => in_brackets = true,
            ']' => in_brackets = false,
            '.' if !in_brackets => {
                if segment.is_empty() {
                    continue;
                }
                steps.push(parse_segment(&segment, path)?);
                segment.clear();
                continue;
            }
            _ => {}
        }
        segment.push(c);
    }
    ensure!(!steps.is_empty(), "empty field path");
    Ok(steps)
}

fn parse_segment(segment: &str, path: &str) -> anyhow::Result<Step> {
    if let Some(filter) = segment.strip_prefix('[') {
        let filter = filter.strip_suffix(']').unwrap_or(filter);
        let (key, value) = filter
            .split_once('=')
            .with_context(|| format!("bad list filter {segment:?} in {path:?}"))?;
        return Ok(Step::Filter {
            key: key.to_owned(),
            value: value.to_owned(),
        });
    }
    if segment.chars().all(|c| c.is_ascii_digit()) {
        return Ok(Step::Index(segment.parse()?));
    }
    Ok(Step::Key(segment.to_owned()))
}

fn get_field<'a>(resource: &'a Value, steps: &[Step]) -> Option<&'a Value> {
    let mut current = resource;
    for step in steps {
        current = match step {
            Step::Key(key) => current.get(key)?,
            Step::Index(i) => current.get(i)?,
            Step::Filter { key, value } => current
                .as_array()?
                .iter()
                .find(|item| item[key.as_str()].as_str() == Some(value))?,
        };
    }
    Some(current)
}

fn navigate_mut<'a>(resource: &'a mut Value, steps: &[Step]) -> anyhow::Result<&'a mut Value> {
    let mut current = resource;
    for step in steps {
        current = match step {
            Step::Key(key) => current
                .get_mut(key.as_str())
                .with_context(|| format!("field {key:?} not found"))?,
            Step::Index(i) => current
                .get_mut(i)
                .with_context(|| format!("index {i} out of bounds"))?,
            Step::Filter { key, value } => current
                .as_array_mut()
                .context("list filter on non-list field")?
                .iter_mut()
                .find(|item| item[key.as_str()].as_str() == Some(value))
                .with_context(|| format!("no list item with {key}={value}"))?,
        };
    }
    Ok(current)
}

fn set_field(
    resource: &mut Value,
    steps: &[Step],
    new: &Value,
    options: &FieldOptions,
) -> anyhow::Result<()> {
    let slot = navigate_mut(resource, steps)?;
    match &options.delimiter {
        None => *slot = new.clone(),
        // With a delimiter only one delimited section of the existing string
        // is replaced, e.g. the tag of "name:tag" with index 1.
        Some(delimiter) => {
            let new = scalar_string(new)?;
            let existing = slot
                .as_str()
                .context("delimiter option needs a string target field")?;
            let mut parts: Vec<String> =
                existing.split(delimiter.as_str()).map(str::to_owned).collect();
            if options.index >= parts.len() {
                parts.resize(options.index + 1, String::new());
            }
            parts[options.index] = new;
            *slot = Value::String(parts.join(delimiter));
        }
    }
    Ok(())
}

fn scalar_string(value: &Value) -> anyhow::Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => bail!("replacement value {other} is not a scalar"),
    }
}

/// Synthesises the overlay that injects the Live object as an annotated
/// local-config resource feeding the user's transformer layer: a virtual
/// `<commit>/local-config-transform/` kustomization pulling in the base
/// layer, the serialised Live, and the transformers.
#[derive(Debug)]
pub struct LocalConfigTransformOverlay<'a> {
    pub base: Layer,
    pub local_config: &'a Live,
    /// Absolute path of the transformer layer inside the commit worktree.
    pub transformers: PathBuf,
}

impl LocalConfigTransformOverlay<'_> {
    pub fn create_layer(&self) -> anyhow::Result<Layer> {
        let mem = MemoryFs::new();
        let base_abs = self.base.fs.cleaned_abs(&self.base.path)?;
        let parent = base_abs
            .parent()
            .context("base layer has no parent directory")?;
        let base_name = base_abs
            .file_name()
            .context("base layer has no directory name")?;
        let overlay_dir = parent.join("local-config-transform");

        let transformers = relative_path(&overlay_dir, &clean_abs(&self.transformers)?)?;
        let kustomization = Kustomization {
            resources: vec![
                Path::new("..").join(base_name).display().to_string(),
                LOCAL_CONFIG_FILE_NAME.to_owned(),
            ],
            transformers: vec![transformers.display().to_string()],
            name_suffix: None,
        };
        write_kustomization(&mem, &overlay_dir, &kustomization)?;

        let mut local_config = self.local_config.clone();
        local_config
            .annotations_mut()
            .insert(LOCAL_CONFIG_ANNOTATION.to_owned(), "true".to_owned());
        mem.write_file(
            &overlay_dir.join(LOCAL_CONFIG_FILE_NAME),
            serde_yaml::to_string(&local_config).context("serialising local config")?,
        )?;

        Ok(Layer {
            fs: Arc::new(LayeredFs::new(vec![
                Arc::new(mem),
                self.base.fs.clone(),
            ])),
            path: overlay_dir,
        })
    }
}

/// Overlay appending `-<suffix>` to every rendered resource name.
#[derive(Debug)]
pub struct NameSuffixOverlay {
    pub base: Layer,
    pub name_suffix: String,
}

impl NameSuffixOverlay {
    pub fn create_layer(&self) -> anyhow::Result<Layer> {
        let mem = MemoryFs::new();
        let base_abs = self.base.fs.cleaned_abs(&self.base.path)?;
        let parent = base_abs
            .parent()
            .context("base layer has no parent directory")?;
        let base_name = base_abs
            .file_name()
            .context("base layer has no directory name")?;
        let overlay_dir = parent.join("name-suffix");

        let kustomization = Kustomization {
            resources: vec![Path::new("..").join(base_name).display().to_string()],
            transformers: vec![],
            name_suffix: Some(format!("-{}", self.name_suffix)),
        };
        write_kustomization(&mem, &overlay_dir, &kustomization)?;

        Ok(Layer {
            fs: Arc::new(LayeredFs::new(vec![
                Arc::new(mem),
                self.base.fs.clone(),
            ])),
            path: overlay_dir,
        })
    }
}

fn write_kustomization(
    mem: &MemoryFs,
    dir: &Path,
    kustomization: &Kustomization,
) -> anyhow::Result<()> {
    mem.write_file(
        &dir.join(KUSTOMIZATION_FILE_NAME),
        serde_yaml::to_string(kustomization).context("serialising kustomization")?,
    )
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use indoc::indoc;
    use kube::ResourceExt as _;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::resources::ResourceId;

    fn mem_layer(files: &[(&str, &str)], path: &str) -> Layer {
        let mem = MemoryFs::new();
        for (file, contents) in files {
            mem.write_file(Path::new(file), *contents).unwrap();
        }
        Layer::new(Arc::new(mem), path)
    }

    #[googletest::test]
    fn test_build_simple_layer() {
        let layer = mem_layer(
            &[
                (
                    "/repo/deploy/kustomization.yaml",
                    "resources:\n- pod.yaml\n",
                ),
                (
                    "/repo/deploy/pod.yaml",
                    indoc! {"
                        apiVersion: v1
                        kind: Pod
                        metadata:
                          name: app
                        spec:
                          containers:
                          - name: app
                            image: app:latest
                    "},
                ),
            ],
            "/repo/deploy",
        );

        let map = layer.build().unwrap();
        expect_that!(map.len(), eq(1));
        let ids = map.ids().unwrap();
        expect_that!(ids[0].kind, eq("Pod"));
        expect_that!(ids[0].name, eq("app"));
    }

    #[googletest::test]
    fn test_build_recurses_into_nested_kustomizations() {
        let layer = mem_layer(
            &[
                (
                    "/repo/top/kustomization.yaml",
                    "resources:\n- ../nested\n- cm.yaml\n",
                ),
                (
                    "/repo/top/cm.yaml",
                    "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: top\n",
                ),
                (
                    "/repo/nested/kustomization.yaml",
                    "resources:\n- cm.yaml\n",
                ),
                (
                    "/repo/nested/cm.yaml",
                    "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: nested\n",
                ),
            ],
            "/repo/top",
        );

        let names: Vec<String> = layer
            .build()
            .unwrap()
            .ids()
            .unwrap()
            .into_iter()
            .map(|id| id.name)
            .collect();
        assert_eq!(names, vec!["nested".to_owned(), "top".to_owned()]);
    }

    #[googletest::test]
    fn test_build_multi_document_manifest() {
        let layer = mem_layer(
            &[
                ("/repo/kustomization.yaml", "resources:\n- all.yaml\n"),
                (
                    "/repo/all.yaml",
                    indoc! {"
                        apiVersion: v1
                        kind: ConfigMap
                        metadata:
                          name: one
                        ---
                        apiVersion: v1
                        kind: ConfigMap
                        metadata:
                          name: two
                    "},
                ),
            ],
            "/repo",
        );
        expect_that!(layer.build().unwrap().len(), eq(2));
    }

    #[googletest::test]
    fn test_build_applies_name_suffix() {
        let layer = mem_layer(
            &[
                (
                    "/repo/kustomization.yaml",
                    "nameSuffix: -staging\nresources:\n- cm.yaml\n",
                ),
                (
                    "/repo/cm.yaml",
                    "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\n",
                ),
            ],
            "/repo",
        );
        let ids = layer.build().unwrap().ids().unwrap();
        expect_that!(ids[0].name, eq("app-staging"));
    }

    #[googletest::test]
    fn test_build_missing_kustomization_fails() {
        let layer = mem_layer(&[("/repo/pod.yaml", "kind: Pod")], "/repo");
        let err = layer.build().unwrap_err();
        expect_that!(format!("{err:#}"), contains_substring("kustomization.yaml"));
    }

    #[googletest::test]
    fn test_build_missing_resource_entry_fails() {
        let layer = mem_layer(
            &[("/repo/kustomization.yaml", "resources:\n- missing.yaml\n")],
            "/repo",
        );
        expect_that!(layer.build(), err(anything()));
    }

    #[googletest::test]
    fn test_local_config_excluded_from_output() {
        let layer = mem_layer(
            &[
                (
                    "/repo/kustomization.yaml",
                    "resources:\n- cm.yaml\n- config.yaml\n",
                ),
                (
                    "/repo/cm.yaml",
                    "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\n",
                ),
                (
                    "/repo/config.yaml",
                    indoc! {"
                        apiVersion: v1
                        kind: ConfigMap
                        metadata:
                          name: hidden
                          annotations:
                            config.kubernetes.io/local-config: \"true\"
                    "},
                ),
            ],
            "/repo",
        );
        let ids = layer.build().unwrap().ids().unwrap();
        expect_that!(ids.len(), eq(1));
        expect_that!(ids[0].name, eq("app"));
    }

    #[googletest::test]
    fn test_unsupported_transformer_kind_fails() {
        let layer = mem_layer(
            &[
                (
                    "/repo/kustomization.yaml",
                    "resources:\n- cm.yaml\ntransformers:\n- t.yaml\n",
                ),
                (
                    "/repo/cm.yaml",
                    "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\n",
                ),
                (
                    "/repo/t.yaml",
                    "apiVersion: builtin\nkind: PrefixTransformer\nmetadata:\n  name: t\n",
                ),
            ],
            "/repo",
        );
        let err = layer.build().unwrap_err();
        expect_that!(
            format!("{err:#}"),
            contains_substring("unsupported transformer kind")
        );
    }

    fn commit_stamping_fixture() -> (Layer, Live) {
        let layer = mem_layer(
            &[
                (
                    "/commit/deploy/kustomization.yaml",
                    "resources:\n- pod.yaml\n",
                ),
                (
                    "/commit/deploy/pod.yaml",
                    indoc! {"
                        apiVersion: v1
                        kind: Pod
                        metadata:
                          name: app
                        spec:
                          containers:
                          - name: app
                            image: registry.example.com/app:latest
                    "},
                ),
                (
                    "/commit/transformers/kustomization.yaml",
                    "resources:\n- replacement.yaml\n",
                ),
                (
                    "/commit/transformers/replacement.yaml",
                    indoc! {"
                        apiVersion: builtin
                        kind: ReplacementTransformer
                        metadata:
                          name: stamp-commit
                        replacements:
                        - source:
                            kind: Live
                            fieldPath: spec.commit
                          targets:
                          - select:
                              kind: Pod
                              name: app
                            fieldPaths:
                            - spec.containers.[name=app].image
                            options:
                              delimiter: \":\"
                              index: 1
                    "},
                ),
            ],
            "/commit/deploy",
        );

        let mut live = Live::default();
        live.metadata.name = Some("app".to_owned());
        live.metadata.namespace = Some("prod".to_owned());
        live.metadata.uid = Some("uid-1".to_owned());
        live.metadata.annotations =
            Some([("team".to_owned(), "deploy".to_owned())].into());
        live.spec.commit = "d4b27c1b9d1ca6e5eb9fc92f6b7a4441e5e41e1d".to_owned();
        (layer, live)
    }

    #[googletest::test]
    fn test_local_config_transform_overlay_stamps_commit() {
        let (base, live) = commit_stamping_fixture();
        let overlay = LocalConfigTransformOverlay {
            base,
            local_config: &live,
            transformers: PathBuf::from("/commit/transformers"),
        };
        let layer = overlay.create_layer().unwrap();
        expect_that!(
            layer.path,
            eq(&PathBuf::from("/commit/local-config-transform"))
        );

        let map = layer.build().unwrap();
        // The Live itself is local-config, so only the pod comes out.
        expect_that!(map.len(), eq(1));
        let pod = map.iter().next().unwrap();
        expect_that!(
            pod.data["spec"]["containers"][0]["image"].as_str().unwrap(),
            eq("registry.example.com/app:d4b27c1b9d1ca6e5eb9fc92f6b7a4441e5e41e1d")
        );
    }

    #[googletest::test]
    fn test_local_config_keeps_existing_annotations() {
        let (base, live) = commit_stamping_fixture();
        let overlay = LocalConfigTransformOverlay {
            base: base.clone(),
            local_config: &live,
            transformers: PathBuf::from("/commit/transformers"),
        };
        let layer = overlay.create_layer().unwrap();
        let local_config: Value = serde_yaml::from_slice(
            &layer
                .fs
                .read_file(Path::new("/commit/local-config-transform/local-config.yaml"))
                .unwrap(),
        )
        .unwrap();
        expect_that!(
            local_config["metadata"]["annotations"]["team"].as_str().unwrap(),
            eq("deploy")
        );
        expect_that!(
            local_config["metadata"]["annotations"][LOCAL_CONFIG_ANNOTATION]
                .as_str()
                .unwrap(),
            eq("true")
        );
        // The input Live is not mutated.
        expect_that!(live.annotations().contains_key(LOCAL_CONFIG_ANNOTATION), eq(false));
    }

    #[googletest::test]
    fn test_name_suffix_overlay() {
        let base = mem_layer(
            &[
                ("/repo/deploy/kustomization.yaml", "resources:\n- cm.yaml\n"),
                (
                    "/repo/deploy/cm.yaml",
                    "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\n",
                ),
            ],
            "/repo/deploy",
        );
        let layer = NameSuffixOverlay {
            base,
            name_suffix: "pr-42".to_owned(),
        }
        .create_layer()
        .unwrap();
        let ids = layer.build().unwrap().ids().unwrap();
        expect_that!(ids, eq(&vec![ResourceId {
            api_version: "v1".to_owned(),
            kind: "ConfigMap".to_owned(),
            namespace: String::new(),
            name: "app-pr-42".to_owned(),
        }]));
    }

    #[googletest::test]
    fn test_parse_field_path() {
        expect_that!(
            parse_field_path("spec.containers.[name=app].image").unwrap(),
            eq(&vec![
                Step::Key("spec".to_owned()),
                Step::Key("containers".to_owned()),
                Step::Filter {
                    key: "name".to_owned(),
                    value: "app".to_owned(),
                },
                Step::Key("image".to_owned()),
            ])
        );
        expect_that!(
            parse_field_path("spec.template.0.name").unwrap(),
            eq(&vec![
                Step::Key("spec".to_owned()),
                Step::Key("template".to_owned()),
                Step::Index(0),
                Step::Key("name".to_owned()),
            ])
        );
        expect_that!(parse_field_path(""), err(anything()));
    }
}
