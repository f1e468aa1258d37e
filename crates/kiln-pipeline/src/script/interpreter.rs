use std::collections::BTreeMap;

use serde_json::json;

use super::{CompiledScript, Segment, Statement, Template};
use crate::types::LoadingEnvironment;

/// Run a compiled script against a loading environment.
///
/// The returned value lists the script output, the recorded step invocations
/// for the step engine, and the final variable bindings. Failures are plain
/// messages; nothing internal crosses this boundary.
pub async fn execute(
    script: &CompiledScript,
    environment: &LoadingEnvironment,
) -> Result<serde_json::Value, String> {
    let mut variables: BTreeMap<String, String> = BTreeMap::new();
    let mut output: Vec<String> = Vec::new();
    let mut steps: Vec<serde_json::Value> = Vec::new();

    for line in &script.lines {
        match &line.statement {
            Statement::Echo(text) => output.push(render(text, &variables)),
            Statement::Set { name, value } => {
                let rendered = render(value, &variables);
                variables.insert(name.clone(), rendered);
            }
            Statement::Require(library) => {
                if environment.resolve(library).is_none() {
                    return Err(format!(
                        "line {}: library '{library}' is not available in loading environment {}",
                        line.number, environment.id
                    ));
                }
            }
            Statement::Invoke { symbol, args } => {
                let args: Vec<String> = args.iter().map(|a| render(a, &variables)).collect();
                tracing::trace!(script = %script.name, symbol = %symbol, ?args, "Step recorded");
                steps.push(json!({ "symbol": symbol, "args": args }));
            }
            Statement::Sleep(duration) => tokio::time::sleep(*duration).await,
            Statement::Fail(message) => {
                let message = render(message, &variables);
                let message = if message.is_empty() {
                    "script failed".to_string()
                } else {
                    message
                };
                return Err(format!("line {}: {message}", line.number));
            }
        }
    }

    Ok(json!({
        "script": script.name,
        "output": output,
        "steps": steps,
        "variables": variables,
        "libraries": environment.libraries.keys().collect::<Vec<_>>(),
    }))
}

fn render(template: &Template, variables: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for segment in &template.segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Variable(name) => {
                if let Some(value) = variables.get(name) {
                    out.push_str(value);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_auto_imports;
    use crate::script::compile;
    use std::path::PathBuf;

    async fn run_src(src: &str, env: &LoadingEnvironment) -> Result<serde_json::Value, String> {
        let script = compile(src, "test", &default_auto_imports()).unwrap();
        execute(&script, env).await
    }

    #[tokio::test]
    async fn echo_and_variables() {
        let value = run_src(
            "set who = world\necho hello ${who}\nset who = ${who}!\necho ${who}",
            &LoadingEnvironment::empty(),
        )
        .await
        .unwrap();
        assert_eq!(value["output"], json!(["hello world", "world!"]));
        assert_eq!(value["variables"]["who"], "world!");
    }

    #[tokio::test]
    async fn invoke_records_steps() {
        let value = run_src("set t = prod\ninvoke sh deploy ${t}", &LoadingEnvironment::empty())
            .await
            .unwrap();
        assert_eq!(
            value["steps"],
            json!([{ "symbol": "pipeline.steps.sh", "args": ["deploy", "prod"] }])
        );
    }

    #[tokio::test]
    async fn require_checks_loading_environment() {
        let err = run_src("require core", &LoadingEnvironment::empty()).await.unwrap_err();
        assert!(err.contains("library 'core' is not available"));

        let mut env = LoadingEnvironment::empty();
        env.libraries.insert("core".into(), PathBuf::from("/tmp/libcore.rlib"));
        let value = run_src("require core\necho ok", &env).await.unwrap();
        assert_eq!(value["libraries"], json!(["core"]));
    }

    #[tokio::test]
    async fn fail_stops_execution_with_line_number() {
        let err = run_src("echo before\nfail boom\necho after", &LoadingEnvironment::empty())
            .await
            .unwrap_err();
        assert_eq!(err, "line 2: boom");
    }
}
