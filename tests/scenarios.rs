//! End-to-end scenarios, one per §8 of SPEC_FULL.md.

use rand::rngs::mock::StepRng;

use waypoint_router::request::{Env, Request, Schema};
use waypoint_router::rule::Rules;
use waypoint_router::upstream::Upstream;

fn schema() -> Schema {
    Schema::builtin()
}

#[test]
fn ip_net_match_plain_and_compiled_agree() {
    let schema = schema();
    let mut rules = Rules::new();
    rules
        .loads(&schema, "client_ip4 in 1.2.3.4/32 => prod", "<mem>")
        .unwrap();
    let req = Request::new(&schema, Env::new().set("REMOTE_ADDR", "1.2.3.4"));

    let on_error = rules.default_on_error();
    let up = rules.match_request(&req, on_error).unwrap().unwrap();
    assert_eq!(up.to_string(), "http://prod,1");

    rules.set_compile(true);
    let on_error = rules.default_on_error();
    let up = rules.match_request(&req, on_error).unwrap().unwrap();
    assert_eq!(up.to_string(), "http://prod,1");
}

#[test]
fn disjunction_over_method() {
    let schema = schema();
    let mut rules = Rules::new();
    rules
        .loads(
            &schema,
            "method in [GET, POST] => p1\nmethod = PATCH => p2\n",
            "<mem>",
        )
        .unwrap();

    let post = Request::new(&schema, Env::new().set("REQUEST_METHOD", "POST"));
    let on_error = rules.default_on_error();
    assert_eq!(
        rules.match_request(&post, on_error).unwrap().unwrap().to_string(),
        "http://p1,1"
    );

    let put = Request::new(&schema, Env::new().set("REQUEST_METHOD", "PUT"));
    let on_error = rules.default_on_error();
    assert!(rules.match_request(&put, on_error).unwrap().is_none());
}

#[test]
fn regex_over_header_subfield() {
    let schema = schema();
    let mut rules = Rules::new();
    rules
        .loads(&schema, r#"headers.x_test ~ "v\d+" => p"#, "<mem>")
        .unwrap();
    let req = Request::new(&schema, Env::new().set("HTTP_X_TEST", "v123"));
    let on_error = rules.default_on_error();
    assert_eq!(
        rules.match_request(&req, on_error).unwrap().unwrap().to_string(),
        "http://p,1"
    );
}

#[test]
fn a_rule_that_errors_is_auto_disabled_and_the_rest_still_evaluate() {
    let schema = schema();
    let mut rules = Rules::new().with_auto_disable(true);
    rules
        .loads(
            &schema,
            "content_length = 5 => first\nmethod = GET => second\n",
            "<mem>",
        )
        .unwrap();
    // A malformed Content-Length makes the first rule's evaluation raise
    // (§8 scenario 4); auto-disable takes it out of rotation and the scan
    // continues to the second rule, which still matches.
    let req = Request::new(
        &schema,
        Env::new().set("REQUEST_METHOD", "GET").set("CONTENT_LENGTH", "not-a-number"),
    );
    let on_error = rules.default_on_error();
    let up = rules.match_request(&req, on_error).unwrap().unwrap();
    assert_eq!(up.to_string(), "http://second,1");
    assert_eq!(rules.disabled_count(), 1);
    assert!(rules.is_disabled(0));
}

#[test]
fn weighted_pick_respects_selection_boundaries() {
    let up = Upstream::try_from("http://a,1 http://b,3".to_string()).unwrap();
    assert_eq!(up.total(), 4);
    assert!(!up.uniform());

    // draws in [0, total) map to a cumulative-weight scan: 0 -> a, 1..3 -> b
    let mut rng = StepRng::new(0, 1);
    assert_eq!(up.select_with(&mut rng).location, "a");
    let mut rng = StepRng::new(1, 1);
    assert_eq!(up.select_with(&mut rng).location, "b");
    let mut rng = StepRng::new(3, 1);
    assert_eq!(up.select_with(&mut rng).location, "b");
}

#[test]
fn override_beats_rule() {
    let schema = schema();
    let mut overrides = Rules::new();
    overrides
        .loads(&schema, "client_ip4 = 1.2.3.4 => ovr", "<mem>")
        .unwrap();
    let mut rules = Rules::new();
    rules.loads(&schema, "method = GET => reg", "<mem>").unwrap();

    let req = Request::new(
        &schema,
        Env::new().set("REMOTE_ADDR", "1.2.3.4").set("REQUEST_METHOD", "GET"),
    );

    let on_error = overrides.default_on_error();
    let hit = overrides.match_request(&req, on_error).unwrap();
    assert_eq!(hit.unwrap().to_string(), "http://ovr,1");

    // Rules still match on their own, just never get consulted once an
    // override already won (Router::match_upstream enforces the order).
    let on_error = rules.default_on_error();
    assert_eq!(
        rules.match_request(&req, on_error).unwrap().unwrap().to_string(),
        "http://reg,1"
    );
}
