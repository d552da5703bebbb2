//! Browser backend driving Playwright through generated Node scripts
//!
//! Each attempt renders the case's steps into one script, runs it with
//! `node`, and reads a JSON summary (final URL, title, probed elements)
//! from the last line of stdout.

use kwrun_common::{Action, BrowserConfig, Capability, Error, Result, Step};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use tokio::process::Command as TokioCommand;
use tracing::{debug, warn};

use crate::backend::{Backend, ElementSnapshot, ExecutionOutcome, Payload, Probe};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }

    fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "chromium" | "chrome" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" | "safari" => Ok(Browser::Webkit),
            other => Err(Error::InvalidConfig(format!("unknown browser '{}'", other))),
        }
    }
}

/// Executes `steps` actions
pub struct PlaywrightBackend {
    base_url: String,
    screenshot_dir: PathBuf,
    viewport_width: u32,
    viewport_height: u32,
    browser: Browser,
    headless: bool,
}

/// Summary line printed by a generated script
#[derive(Debug, Deserialize)]
struct ScriptReport {
    success: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    elements: BTreeMap<String, ElementSnapshot>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    step: Option<usize>,
}

impl PlaywrightBackend {
    pub fn new(config: &BrowserConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.screenshot_dir)?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            screenshot_dir: config.screenshot_dir.clone(),
            viewport_width: config.viewport_width,
            viewport_height: config.viewport_height,
            browser: Browser::parse(&config.browser)?,
            headless: config.headless,
        })
    }

    /// Build the Playwright script for a set of steps and probes
    pub fn build_script(&self, steps: &[Step], probes: &[Probe]) -> String {
        let mut script = String::new();

        script.push_str(&format!(
            r#"
const {{ chromium, firefox, webkit }} = require('playwright');

(async () => {{
  const browser = await {browser}.launch({{ headless: {headless} }});
  const context = await browser.newContext({{
    viewport: {{ width: {width}, height: {height} }}
  }});
  const page = await context.newPage();
  const baseUrl = {base_url};
  const resolveUrl = (u) => /^https?:\/\//.test(u) ? u : baseUrl + (u.startsWith('/') ? u : '/' + u);
  let currentStep = 0;

  try {{
"#,
            browser = self.browser.as_str(),
            headless = self.headless,
            width = self.viewport_width,
            height = self.viewport_height,
            base_url = js(&self.base_url),
        ));

        for (i, step) in steps.iter().enumerate() {
            script.push_str(&format!(
                "\n    // Step {}: {}\n    currentStep = {};\n",
                i + 1,
                step.keyword(),
                i
            ));
            script.push_str(&self.step_to_js(step));
            script.push('\n');
        }

        script.push_str("\n    const elements = {};\n");
        for probe in probes {
            script.push_str(&probe_to_js(probe));
        }

        script.push_str(
            r#"
    console.log(JSON.stringify({ success: true, url: page.url(), title: await page.title(), elements }));
  } catch (error) {
    console.log(JSON.stringify({ success: false, step: currentStep, url: page.url(), error: error.message }));
    process.exitCode = 1;
  } finally {
    await browser.close();
  }
})();
"#,
        );

        script
    }

    /// Convert a step to JavaScript code
    fn step_to_js(&self, step: &Step) -> String {
        match step {
            Step::Navigate { url } => {
                format!("    await page.goto(resolveUrl({}));", js(url))
            }
            Step::Click { locator, timeout_ms } => format!(
                "    await page.click({}, {{ timeout: {} }});",
                js(locator),
                timeout_ms.unwrap_or(5000)
            ),
            Step::Input {
                locator,
                value,
                clear,
            } => {
                if *clear {
                    format!(
                        "    await page.fill({loc}, '');\n    await page.fill({loc}, {val});",
                        loc = js(locator),
                        val = js(value)
                    )
                } else {
                    format!(
                        "    await page.locator({}).pressSequentially({});",
                        js(locator),
                        js(value)
                    )
                }
            }
            Step::Select { locator, value } => {
                format!("    await page.selectOption({}, {});", js(locator), js(value))
            }
            Step::Press { locator, key } => match locator {
                Some(loc) => format!("    await page.locator({}).press({});", js(loc), js(key)),
                None => format!("    await page.keyboard.press({});", js(key)),
            },
            Step::Hover { locator } => format!("    await page.hover({});", js(locator)),
            Step::Check { locator } => format!("    await page.check({});", js(locator)),
            Step::Uncheck { locator } => format!("    await page.uncheck({});", js(locator)),
            Step::WaitForElement {
                locator,
                state,
                timeout_ms,
            } => format!(
                "    await page.waitForSelector({}, {{ state: '{}', timeout: {} }});",
                js(locator),
                state.as_str(),
                timeout_ms
            ),
            Step::WaitForUrl { url, timeout_ms } => format!(
                "    await page.waitForURL((u) => u.toString().includes({}), {{ timeout: {} }});",
                js(url),
                timeout_ms
            ),
            Step::WaitForText {
                locator,
                text,
                timeout_ms,
            } => format!(
                "    await page.locator({}).filter({{ hasText: {} }}).first().waitFor({{ timeout: {} }});",
                js(locator),
                js(text),
                timeout_ms
            ),
            Step::Sleep { ms } => format!("    await page.waitForTimeout({});", ms),
            Step::Screenshot { name, full_page } => {
                let path = self.screenshot_dir.join(format!("{}.png", name));
                format!(
                    "    await page.screenshot({{ path: {}, fullPage: {} }});",
                    js(&path.to_string_lossy()),
                    full_page
                )
            }
            Step::ExecuteJs { script } => {
                format!("    await page.evaluate(() => {{ {} }});", script)
            }
        }
    }

    /// Execute the full script via Node
    async fn run_script(&self, script: &str) -> Result<(ScriptReport, String)> {
        let temp_dir = tempfile::tempdir()?;
        let script_path = temp_dir.path().join("case.js");
        std::fs::write(&script_path, script)?;

        debug!("Running Playwright script: {}", script_path.display());

        let output = TokioCommand::new("node")
            .arg(&script_path)
            .current_dir(temp_dir.path())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Backend(format!("failed to start node: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let report = stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<ScriptReport>(line.trim()).ok());

        match report {
            Some(report) => Ok((report, stdout)),
            None => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!("Playwright script produced no report: {}", stderr.trim());
                Err(Error::Backend(format!(
                    "script failed:\nstdout: {}\nstderr: {}",
                    stdout, stderr
                )))
            }
        }
    }
}

#[async_trait::async_trait]
impl Backend for PlaywrightBackend {
    fn capability(&self) -> Capability {
        Capability::Steps
    }

    async fn execute(&self, payload: &Payload) -> Result<ExecutionOutcome> {
        let Action::Steps(steps) = &payload.action else {
            return Err(Error::Backend(
                "browser backend only serves step actions".to_string(),
            ));
        };

        let start = Instant::now();
        let script = self.build_script(steps, &payload.probes);
        let (report, stdout) = self.run_script(&script).await?;
        let elapsed = start.elapsed();

        if !report.success {
            let message = report.error.unwrap_or_else(|| "unknown error".to_string());
            let step = report
                .step
                .and_then(|i| steps.get(i))
                .map(Step::keyword)
                .unwrap_or_default();
            // network-level navigation failures are worth another attempt
            if message.contains("net::ERR_") {
                return Err(Error::BackendTransport(format!("{}: {}", step, message)));
            }
            return Err(Error::Backend(format!("step {} failed: {}", step, message)));
        }

        let raw = json!({
            "url": report.url,
            "title": report.title,
            "stdout": stdout,
        });

        Ok(ExecutionOutcome {
            status: None,
            url: report.url,
            body: Value::Null,
            text: report.title.unwrap_or_default(),
            headers: BTreeMap::new(),
            elements: report.elements,
            elapsed,
            raw,
        })
    }
}

fn probe_to_js(probe: &Probe) -> String {
    let attributes = probe
        .attributes
        .iter()
        .map(|a| format!("{a}: await loc.getAttribute({a})", a = js(a)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"    {{
      const loc = page.locator({locator}).first();
      const present = (await page.locator({locator}).count()) > 0;
      elements[{locator}] = present
        ? {{ visible: await loc.isVisible(), text: await loc.innerText(), attributes: {{ {attributes} }} }}
        : {{ visible: false, text: null, attributes: {{}} }};
    }}
"#,
        locator = js(&probe.locator),
        attributes = attributes,
    )
}

/// Quote a string as a JavaScript literal
fn js(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}
