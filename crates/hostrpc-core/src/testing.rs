//! Test suites authored locally and executed on the remote host.
//!
//! A test class is a script `class` whose `setUp`, `tearDown` and `test*`
//! members are all static. Each test runs as three remote calls (setUp,
//! the test, tearDown), each receiving `null` where an instance would go.
//! A test fails when any of its calls raises.

use crate::args::CallArg;
use crate::client::RpcClient;
use crate::config::RpcSettings;
use crate::error::{Result, RpcError};
use crate::factory::RpcFactory;
use crate::remap::RemapPairs;
use crate::script::{ClassMember, ScriptClass};
use crate::validation::{validate_class_method, validate_test_case_class};
use tracing::{debug, info, warn};

const SET_UP: &str = "setUp";
const TEAR_DOWN: &str = "tearDown";
const TEST_PREFIX: &str = "test";

/// A remote test class bound to the server it runs against.
pub struct RemoteTestCase {
    class: ScriptClass,
    port: Option<u16>,
    settings: RpcSettings,
    remap_pairs: RemapPairs,
    default_imports: Vec<String>,
}

impl RemoteTestCase {
    pub fn new(class: ScriptClass, port: Option<u16>) -> Self {
        Self {
            class,
            port,
            settings: RpcSettings::from_env(),
            remap_pairs: RemapPairs::default(),
            default_imports: Vec::new(),
        }
    }

    pub fn settings(mut self, settings: RpcSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn remap_pairs(mut self, remap_pairs: RemapPairs) -> Self {
        self.remap_pairs = remap_pairs;
        self
    }

    pub fn default_imports(mut self, imports: Vec<String>) -> Self {
        self.default_imports = imports;
        self
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn class(&self) -> &ScriptClass {
        &self.class
    }

    /// Test members in name order.
    pub fn tests(&self) -> Vec<&ClassMember> {
        let mut tests: Vec<&ClassMember> = self
            .class
            .members()
            .iter()
            .filter(|m| m.name.starts_with(TEST_PREFIX))
            .collect();
        tests.sort_by(|a, b| a.name.cmp(&b.name));
        tests
    }

    /// Run every test. Errors only when the suite itself is malformed or the
    /// client cannot be built; test failures land in the report.
    pub async fn run(&self) -> Result<TestReport> {
        let port = validate_test_case_class(self)?;
        let tests = self.tests();
        let set_up = self.class.member(SET_UP);
        let tear_down = self.class.member(TEAR_DOWN);
        for member in tests.iter().copied().chain(set_up).chain(tear_down) {
            validate_class_method(&self.class, member)?;
        }

        let client = RpcClient::with_settings(port, &self.settings)?;
        let factory = RpcFactory::with_settings(client, &self.settings)
            .remap_pairs(self.remap_pairs.clone())
            .default_imports(self.default_imports.clone());

        info!("Running {} remote tests from {}", tests.len(), self.class.name());
        let mut report = TestReport::default();
        for test in tests {
            let name = format!("{}.{}", self.class.name(), test.name);
            match self.run_one(&factory, test, set_up, tear_down).await {
                Ok(()) => {
                    debug!("{} ... ok", name);
                    report.passed.push(name);
                }
                Err(e) => {
                    warn!("{} ... FAIL: {}", name, e);
                    report.failed.push(TestFailure { name, error: e });
                }
            }
        }
        Ok(report)
    }

    async fn run_one(
        &self,
        factory: &RpcFactory,
        test: &ClassMember,
        set_up: Option<&ClassMember>,
        tear_down: Option<&ClassMember>,
    ) -> Result<()> {
        if let Some(set_up) = set_up {
            self.call(factory, set_up).await?;
        }
        let outcome = self.call(factory, test).await;
        // tearDown runs even when the test failed.
        if let Some(tear_down) = tear_down {
            let cleanup = self.call(factory, tear_down).await;
            outcome?;
            return cleanup;
        }
        outcome
    }

    async fn call(&self, factory: &RpcFactory, member: &ClassMember) -> Result<()> {
        let function = self.class.function(member);
        factory
            .run_function_remotely(&function, vec![CallArg::Null])
            .await
            .map(|_| ())
    }
}

/// One failed test and the error it raised.
#[derive(Debug)]
pub struct TestFailure {
    pub name: String,
    pub error: RpcError,
}

/// Outcome of [`RemoteTestCase::run`].
#[derive(Debug, Default)]
pub struct TestReport {
    pub passed: Vec<String>,
    pub failed: Vec<TestFailure>,
}

impl TestReport {
    pub fn total(&self) -> usize {
        self.passed.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SUITE: &str = r#"class SceneTests {
    static setUp() {}
    static tearDown() {}
    static testB() {}
    static testA() {}
    static helper() {}
}
"#;

    fn class(text: &str) -> ScriptClass {
        ScriptClass::parse(PathBuf::from("/scripts/suite.js"), "SceneTests".into(), text).unwrap()
    }

    #[test]
    fn test_tests_are_sorted_and_filtered() {
        let case = RemoteTestCase::new(class(SUITE), Some(9998));
        let names: Vec<&str> = case.tests().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["testA", "testB"]);
    }

    #[tokio::test]
    async fn test_missing_port_is_rejected() {
        let case = RemoteTestCase::new(class(SUITE), None);
        let err = case.run().await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidTestCasePort { .. }));
    }

    #[tokio::test]
    async fn test_instance_test_method_is_rejected() {
        let text = "class SceneTests {\n    static setUp() {}\n    testInstance() {}\n}\n";
        let case = RemoteTestCase::new(class(text), Some(9998)).settings(RpcSettings::default());
        let err = case.run().await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidClassMethod { .. }));
    }

    #[test]
    fn test_report_totals() {
        let report = TestReport {
            passed: vec!["S.testA".into()],
            failed: vec![TestFailure {
                name: "S.testB".into(),
                error: RpcError::Other("boom".into()),
            }],
        };
        assert_eq!(report.total(), 2);
        assert!(!report.is_success());
    }
}
