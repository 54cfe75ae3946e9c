/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/test_runner.rs
*
* Post-deployment verification of a namespace. A run is started once and then
* polled by the queue controller until it reports a verdict.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::Queue;
use crate::errors::Error;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestVerdict {
    Running,
    Passed,
    Failed,
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn trigger(&self, namespace: &str, queue: &Queue) -> Result<(), Error>;

    async fn verdict(&self, namespace: &str, queue: &Queue) -> Result<TestVerdict, Error>;
}

pub fn build_test_runner(name: &str) -> Result<Arc<dyn TestRunner>, Error> {
    match name {
        "none" => Ok(Arc::new(NoTestRunner)),
        "mock" => Ok(Arc::new(MockTestRunner::default())),
        other => Err(Error::Config(format!("unknown test runner '{}'", other))),
    }
}

/// Treats every deployment as verified.
pub struct NoTestRunner;

#[async_trait]
impl TestRunner for NoTestRunner {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn trigger(&self, _namespace: &str, _queue: &Queue) -> Result<(), Error> {
        Ok(())
    }

    async fn verdict(&self, _namespace: &str, _queue: &Queue) -> Result<TestVerdict, Error> {
        Ok(TestVerdict::Passed)
    }
}

/// Fails runs in namespaces marked with `fail_namespace`.
#[derive(Default)]
pub struct MockTestRunner {
    failing: Mutex<BTreeSet<String>>,
}

impl MockTestRunner {
    pub fn fail_namespace(&self, namespace: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(namespace.to_string());
        }
    }
}

#[async_trait]
impl TestRunner for MockTestRunner {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn trigger(&self, _namespace: &str, _queue: &Queue) -> Result<(), Error> {
        Ok(())
    }

    async fn verdict(&self, namespace: &str, _queue: &Queue) -> Result<TestVerdict, Error> {
        let failing = self
            .failing
            .lock()
            .map_err(|_| Error::TestRunner("mock state poisoned".to_string()))?;
        Ok(if failing.contains(namespace) {
            TestVerdict::Failed
        } else {
            TestVerdict::Passed
        })
    }
}
