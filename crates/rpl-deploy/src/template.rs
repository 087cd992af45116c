use std::collections::BTreeMap;

use rpl_core::Image;
use serde::Deserialize;

use crate::DeployError;

/// Starter manifest written by `rpl init`.
pub const DEFAULT_MANIFEST_TEMPLATE: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ release_name }}
  namespace: {{ namespace }}
  labels:
    app.kubernetes.io/name: {{ release_name }}
    app.kubernetes.io/version: "{{ image.tag }}"
spec:
  replicas: 1
  selector:
    matchLabels:
      app.kubernetes.io/name: {{ release_name }}
  template:
    metadata:
      labels:
        app.kubernetes.io/name: {{ release_name }}
    spec:
      containers:
        - name: app
          image: "{{ image.repository }}@{{ image.digest }}"
          resources:
            limits:
              cpu: "{{ resources.cpu }}"
              memory: "{{ resources.memory }}"
"#;

/// Values available to a template, keyed by dotted name.
pub type TemplateValues = BTreeMap<String, String>;

pub fn template_values(
    namespace: &str,
    release_name: &str,
    image: &Image,
    resources: &BTreeMap<String, String>,
) -> TemplateValues {
    let mut values = TemplateValues::new();
    values.insert("namespace".into(), namespace.to_string());
    values.insert("release_name".into(), release_name.to_string());
    values.insert("image.repository".into(), image.repository.clone());
    values.insert("image.tag".into(), image.tag.clone());
    values.insert("image.digest".into(), image.digest.clone());
    for (k, v) in resources {
        values.insert(format!("resources.{k}"), v.clone());
    }
    values
}

/// Substitute `{{ key }}` placeholders. Unknown or malformed placeholders are errors,
/// and the result must parse as (multi-document) YAML.
pub fn render(template: &str, values: &TemplateValues) -> Result<String, DeployError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| DeployError::InvalidManifest("unterminated placeholder".into()))?;
        let key = after[..end].trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
            return Err(DeployError::InvalidManifest(format!("malformed placeholder {{{{{}}}}}", &after[..end])));
        }
        let value = values
            .get(key)
            .ok_or_else(|| DeployError::InvalidManifest(format!("unknown placeholder {key}")))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    validate_yaml(&out)?;
    Ok(out)
}

fn validate_yaml(manifest: &str) -> Result<(), DeployError> {
    let mut documents = 0;
    for doc in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_yaml::Value::deserialize(doc).map_err(|e| DeployError::InvalidManifest(e.to_string()))?;
        if !value.is_null() {
            documents += 1;
        }
    }
    if documents == 0 {
        return Err(DeployError::InvalidManifest("manifest is empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> TemplateValues {
        let image = Image {
            repository: "reg/app".into(),
            tag: "abc-1".into(),
            digest: "sha256:ff".into(),
        };
        let resources = BTreeMap::from([("cpu".to_string(), "500m".to_string()), ("memory".to_string(), "512Mi".to_string())]);
        template_values("dev", "app", &image, &resources)
    }

    #[test]
    fn renders_default_template() {
        let out = render(DEFAULT_MANIFEST_TEMPLATE, &values()).unwrap();
        assert!(out.contains("image: \"reg/app@sha256:ff\""));
        assert!(out.contains("namespace: dev"));
        assert!(out.contains("memory: \"512Mi\""));
        assert!(!out.contains("{{"));
    }

    #[test]
    fn unknown_placeholder_is_invalid() {
        let err = render("name: {{ replicas }}\n", &values()).unwrap_err();
        assert!(matches!(err, DeployError::InvalidManifest(m) if m.contains("replicas")));
    }

    #[test]
    fn unterminated_placeholder_is_invalid() {
        assert!(render("name: {{ namespace\n", &values()).is_err());
    }

    #[test]
    fn rendered_output_must_be_yaml() {
        assert!(render("a: [unclosed\n", &values()).is_err());
        assert!(render("", &values()).is_err());
        assert!(render("a: 1\n---\nb: {{namespace}}\n", &values()).is_ok());
    }
}
