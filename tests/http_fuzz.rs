//! No input, however malformed, may make the service answer 5xx

mod common;

use bytes::Bytes;
use common::{setup_or_skip, Suite};
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method};
use reporter_harness::fuzz::{deep_nesting, report_payload_seeds, template_seeds, Mutator};
use reporter_harness::models::OutputFormat;
use reporter_harness::probe::MultipartFile;
use reporter_harness::ProbeResponse;

const SEED: u64 = 0x5eed_f00d;
const REPORT_CASES: usize = 150;
const TEMPLATE_CASES: usize = 100;

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

/// Transport errors are tolerated; a 5xx answer is the violation
fn check(case: usize, input: &[u8], outcome: reporter_harness::Result<ProbeResponse>, failures: &mut Vec<String>) {
    match outcome {
        Ok(resp) if resp.is_server_error() => failures.push(format!(
            "case {} (seed {:#x}): {} for {:?}",
            case,
            SEED,
            resp.status,
            String::from_utf8_lossy(input)
        )),
        Ok(_) => {}
        Err(e) => eprintln!("case {}: transport error {}", case, e),
    }
}

async fn fuzz_report_creation(suite: &Suite) -> Vec<String> {
    let mut seeds: Vec<Vec<u8>> = report_payload_seeds()
        .iter()
        .map(|v| serde_json::to_vec(v).unwrap())
        .collect();
    seeds.push(deep_nesting(10_000));

    let mut cases = seeds.clone();
    cases.extend(Mutator::seeded(SEED).generate(&seeds, REPORT_CASES));

    let mut failures = Vec::new();
    for (case, input) in cases.iter().enumerate() {
        let outcome = suite
            .client
            .request_raw(
                Method::POST,
                "/v1/reports",
                &json_headers(),
                Bytes::from(input.clone()),
                &suite.cancel,
            )
            .await;
        check(case, input, outcome, &mut failures);
    }

    failures
}

async fn fuzz_template_upload(suite: &Suite) -> Vec<String> {
    let seeds = template_seeds();
    let mut cases = seeds.clone();
    cases.extend(Mutator::seeded(SEED).generate(&seeds, TEMPLATE_CASES));

    let mut failures = Vec::new();
    for (case, input) in cases.iter().enumerate() {
        let format = OutputFormat::ALL[case % OutputFormat::ALL.len()];
        let file = MultipartFile::new("template", "fuzz.tpl", input.clone()).with_content_type("text/plain");
        let outcome = suite
            .client
            .upload_multipart(
                "/v1/templates",
                &HeaderMap::new(),
                &[("outputFormat", format.as_str()), ("description", "fuzz")],
                vec![file],
                &suite.cancel,
            )
            .await;
        check(case, input, outcome, &mut failures);
    }

    // Raw garbage where a multipart body is expected
    let offset = cases.len();
    for (case, input) in Mutator::seeded(SEED ^ 1).generate(&seeds, 20).iter().enumerate() {
        let outcome = suite
            .client
            .request_raw(
                Method::POST,
                "/v1/templates",
                &HeaderMap::new(),
                Bytes::from(input.clone()),
                &suite.cancel,
            )
            .await;
        check(offset + case, input, outcome, &mut failures);
    }
    failures
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_input_never_answers_5xx() {
    let Some(suite) = setup_or_skip("http-fuzz", false).await else {
        return;
    };
    suite
        .client
        .wait_for_system_health(suite.config.chaos.readiness_timeout, &suite.cancel)
        .await
        .unwrap();

    let mut failures = fuzz_report_creation(&suite).await;
    failures.extend(fuzz_template_upload(&suite).await);

    let teardown = suite.teardown().await;
    assert!(failures.is_empty(), "server errors:\n{}", failures.join("\n"));
    teardown.unwrap();
}
