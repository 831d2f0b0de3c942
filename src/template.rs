use std::io::Write;
use std::path::Path;

use tera::{Context, Tera};
use walkdir::WalkDir;

use crate::fs::{TEMPLATE_SUFFIX, create_and_open};

#[derive(thiserror::Error, Debug)]
pub enum TemplateError {
    #[error("cannot render template `{template}`: {raw_error_message}")]
    Render {
        template: String,
        raw_error_message: String,
    },

    #[error("cannot write rendered template `{template}`: {raw_error_message}")]
    Write {
        template: String,
        raw_error_message: String,
    },
}

/// Renders every `*.jinja` file under `from_dir` against `context` and
/// writes the result into `to_dir`, with the suffix stripped
/// (`jest.config.ts.jinja` becomes `jest.config.ts`).
pub fn render_template_files(from_dir: &Path, to_dir: &Path, context: &Context) -> Result<(), TemplateError> {
    let from_dir_str = from_dir.to_str().unwrap_or_default();
    let glob = format!("{from_dir_str}/**/*{TEMPLATE_SUFFIX}");
    let tera = Tera::new(glob.as_str()).map_err(|e| TemplateError::Render {
        template: glob.clone(),
        raw_error_message: e.to_string(),
    })?;

    let templates = WalkDir::new(from_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_file()
                && e.file_name()
                    .to_str()
                    .map(|s| s.ends_with(TEMPLATE_SUFFIX))
                    .unwrap_or(false)
        });

    for template in templates {
        let relative_path = template
            .path()
            .strip_prefix(from_dir)
            .unwrap_or(template.path())
            .to_str()
            .unwrap_or_default()
            .replace(std::path::MAIN_SEPARATOR, "/");

        let content = tera.render(&relative_path, context).map_err(|e| TemplateError::Render {
            template: relative_path.clone(),
            raw_error_message: e.to_string(),
        })?;

        let target = to_dir.join(relative_path.trim_end_matches(TEMPLATE_SUFFIX));
        let mut file = create_and_open(&target).map_err(|e| TemplateError::Write {
            template: relative_path.clone(),
            raw_error_message: e.to_string(),
        })?;
        file.write_all(content.as_bytes()).map_err(|e| TemplateError::Write {
            template: relative_path.clone(),
            raw_error_message: e.to_string(),
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, read_to_string, write};
    use tempfile::TempDir;

    #[test]
    fn test_render_template_files() {
        let src = TempDir::new().expect("error creating temporary dir");
        let dst = TempDir::new().expect("error creating temporary dir");

        create_dir_all(src.path().join("nested")).unwrap();
        write(
            src.path().join("jest.config.ts.jinja"),
            "url: {{ job.inference_api_url }}",
        )
        .unwrap();
        write(src.path().join("nested/data.env.jinja"), "workspace={{ workspace_id }}").unwrap();
        write(src.path().join("workflow.ts"), "not a template").unwrap();

        let mut context = Context::new();
        context.insert("workspace_id", "w-1");
        context.insert(
            "job",
            &serde_json::json!({"inference_api_url": "https://inference.askui.com"}),
        );

        render_template_files(src.path(), dst.path(), &context).expect("render must succeed");

        assert_eq!(
            read_to_string(dst.path().join("jest.config.ts")).unwrap(),
            "url: https://inference.askui.com"
        );
        assert_eq!(
            read_to_string(dst.path().join("nested/data.env")).unwrap(),
            "workspace=w-1"
        );
        // non-template files are handled by the directory copy, not here
        assert!(!dst.path().join("workflow.ts").exists());
    }

    #[test]
    fn test_render_template_files_bad_template() {
        let src = TempDir::new().expect("error creating temporary dir");
        let dst = TempDir::new().expect("error creating temporary dir");
        write(src.path().join("broken.txt.jinja"), "{{ unclosed").unwrap();

        let result = render_template_files(src.path(), dst.path(), &Context::new());
        assert!(matches!(result, Err(TemplateError::Render { .. })));
    }
}
