//! Workflow definition files.
//!
//! Definitions are YAML (`.yaml`/`.yml`) or JSON (`.json`) documents that
//! deserialize into [`WorkflowDefinition`]. Parsing is structural only;
//! tool registration and step references are validated by the engine.

use std::path::Path;

use reportflow_types::workflow::WorkflowDefinition;

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml_ng::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
}

/// Parse a definition from YAML text. JSON is valid YAML, so this accepts both.
pub fn parse_definition_yaml(content: &str) -> Result<WorkflowDefinition, serde_yaml_ng::Error> {
    serde_yaml_ng::from_str(content)
}

/// Load a definition file, choosing the parser by extension.
pub async fn load_definition(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let display = path.display().to_string();
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DefinitionError::Io {
            path: display.clone(),
            source,
        })?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&content).map_err(|source| DefinitionError::Json {
            path: display,
            source,
        })
    } else {
        parse_definition_yaml(&content).map_err(|source| DefinitionError::Yaml {
            path: display,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const INVENTORY_YAML: &str = r#"
owner_id: dealer-42
name: weekly inventory
steps:
  - name: fetch
    tool: http
    config:
      url: https://dms.example.test/inventory
  - name: notify
    tool: echo
    config:
      subject: "Inventory: ${step0.body.total} vehicles"
      rows: "${step0.body.rows}"
"#;

    #[test]
    fn yaml_definition_parses() {
        let def = parse_definition_yaml(INVENTORY_YAML).unwrap();
        assert_eq!(def.owner_id, "dealer-42");
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[0].tool, "http");
        assert_eq!(
            def.steps[1].config["subject"],
            "Inventory: ${step0.body.total} vehicles"
        );
        assert_eq!(def.steps[1].config["rows"], "${step0.body.rows}");
    }

    #[tokio::test]
    async fn json_file_loads_by_extension() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("report.json");
        tokio::fs::write(
            &path,
            r#"{ "owner_id": "dealer-1", "name": "r", "steps": [{ "name": "a", "tool": "echo" }] }"#,
        )
        .await
        .unwrap();

        let def = load_definition(&path).await.unwrap();
        assert_eq!(def.name, "r");
        assert!(def.steps[0].config.is_null());
    }

    #[tokio::test]
    async fn missing_steps_and_missing_files_are_errors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.yaml");
        tokio::fs::write(&path, "owner_id: x\nname: y\n").await.unwrap();
        assert!(matches!(
            load_definition(&path).await,
            Err(DefinitionError::Yaml { .. })
        ));

        assert!(matches!(
            load_definition(&tmp.path().join("absent.yaml")).await,
            Err(DefinitionError::Io { .. })
        ));
    }
}
