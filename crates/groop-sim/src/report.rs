/// Step and scenario results, printed to stderr or emitted as JSON lines.
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub ok: bool,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub steps: Vec<StepResult>,
    pub total_ms: f64,
    pub passed: usize,
    pub failed: usize,
}

impl ScenarioResult {
    pub fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.into(),
            steps: Vec::new(),
            total_ms: 0.0,
            passed: 0,
            failed: 0,
        }
    }

    pub fn add(&mut self, step: StepResult) {
        if step.ok {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.steps.push(step);
    }

    pub fn finalize(&mut self, start: Instant) {
        self.total_ms = start.elapsed().as_secs_f64() * 1000.0;
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn print_summary(&self) {
        let verdict = if self.success() { "PASS" } else { "FAIL" };
        eprintln!("\n[{verdict}] {} ({:.1}ms)", self.scenario, self.total_ms);
        for step in &self.steps {
            let mark = if step.ok { " ok " } else { "FAIL" };
            match &step.detail {
                Some(detail) => {
                    eprintln!("  [{mark}] {} ({:.1}ms): {detail}", step.step, step.elapsed_ms)
                }
                None => eprintln!("  [{mark}] {} ({:.1}ms)", step.step, step.elapsed_ms),
            }
        }
    }

    pub fn emit_json(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{json}");
        }
    }
}

/// Run one timed step. `Ok` carries an optional detail, `Err` the failure.
pub async fn timed_step<F, Fut>(name: &str, f: F) -> StepResult
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String, String>>,
{
    let start = Instant::now();
    let outcome = f().await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    match outcome {
        Ok(detail) => StepResult {
            step: name.into(),
            ok: true,
            elapsed_ms,
            detail: (!detail.is_empty()).then_some(detail),
        },
        Err(detail) => StepResult {
            step: name.into(),
            ok: false,
            elapsed_ms,
            detail: Some(detail),
        },
    }
}

/// Turn an expectation into a step outcome.
pub fn expect(condition: bool, failure: impl Into<String>) -> Result<String, String> {
    if condition {
        Ok(String::new())
    } else {
        Err(failure.into())
    }
}
