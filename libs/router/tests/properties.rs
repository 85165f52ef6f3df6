//! Property tests over whole request round trips

mod common;

use common::{fast_config, requested_securities, start_with};
use proptest::prelude::*;
use request_router::test_utils::{
    reference_data_partial, reference_data_response, security_data, ScriptedSession,
};
use request_router::{Element, Row};
use std::collections::BTreeMap;

const FIELDS: [&str; 3] = ["PX_LAST", "BID", "ASK"];

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_last_write_wins_across_partials(
        updates in prop::collection::vec((0usize..FIELDS.len(), -1000i64..1000), 1..12)
    ) {
        let mut expected = Row::new();
        for (field, value) in &updates {
            expected.insert(FIELDS[*field].to_string(), Element::from(*value));
        }

        let script = updates.clone();
        let session = ScriptedSession::new();
        session.respond_with(move |_, cid| {
            let mut events: Vec<_> = script
                .iter()
                .map(|(field, value)| {
                    reference_data_partial(
                        cid,
                        vec![security_data("F Equity", &[(FIELDS[*field], Element::from(*value))])],
                    )
                })
                .collect();
            events.push(reference_data_response(cid, vec![security_data("F Equity", &[])]));
            events
        });

        let data = runtime().block_on(async {
            let router = start_with(&session, fast_config()).await;
            let (data, _) = router.reference_data(["F Equity"], FIELDS).await.unwrap();
            router.stop().await.unwrap();
            data
        });

        prop_assert_eq!(&data["F Equity"], &expected);
    }

    #[test]
    fn prop_every_security_arrives_exactly_once(
        count in 1usize..20,
        batch in 1usize..6,
    ) {
        let securities: Vec<String> = (0..count).map(|n| format!("SEC{:02} Equity", n)).collect();

        let session = ScriptedSession::new();
        session.respond_with(|request, cid| {
            let items = requested_securities(request)
                .iter()
                .map(|security| security_data(security, &[("PX_LAST", Element::from(1.0))]))
                .collect();
            vec![reference_data_response(cid, items)]
        });

        let mut config = fast_config();
        config.max_securities_per_request = batch;
        let data = runtime().block_on(async {
            let router = start_with(&session, config).await;
            let (data, _) = router
                .reference_data(securities.clone(), ["PX_LAST"])
                .await
                .unwrap();
            router.stop().await.unwrap();
            data
        });

        prop_assert_eq!(data.keys().cloned().collect::<Vec<_>>(), securities.clone());

        let mut submitted: BTreeMap<String, usize> = BTreeMap::new();
        for sent in session.sent_requests() {
            for security in requested_securities(&sent.request) {
                *submitted.entry(security).or_default() += 1;
            }
        }
        prop_assert!(submitted.values().all(|n| *n == 1));
        prop_assert_eq!(submitted.len(), count);
        prop_assert_eq!(session.sent_requests().len(), (count + batch - 1) / batch);
    }
}
