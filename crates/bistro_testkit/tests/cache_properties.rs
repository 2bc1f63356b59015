//! Cache behavior across crates: reference-model checks, cascade deletes,
//! reload coherence and the review/rating lifecycle.

use bistro_core::{ChangeKind, CoreError, EntityKind, SyncStatus};
use bistro_store::{Rating, Restaurant, RestaurantId};
use bistro_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeSet;

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn caches_match_reference_model(ops in cache_op_sequence_strategy(1, 40)) {
        let mut harness = IntegrationHarness::new();
        for op in &ops {
            harness.apply(op);
        }
        harness.verify();
    }

    #[test]
    fn reload_mirrors_store_keys(ops in cache_op_sequence_strategy(1, 30)) {
        let mut harness = IntegrationHarness::new();
        for op in &ops {
            harness.apply(op);
        }
        let t = &harness.t;
        t.caches().reload_all().unwrap();

        let stored: BTreeSet<String> = t
            .backend
            .snapshot()
            .restaurants
            .values()
            .map(|r| r.name().to_string())
            .collect();
        let cached: BTreeSet<String> = t
            .restaurants()
            .list()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        prop_assert_eq!(stored, cached);
        prop_assert!(ratings_consistent(t));
    }
}

#[test]
fn cafe_x_end_to_end() {
    with_test_context(|t| {
        t.add_restaurant("Cafe X", "Downtown");
        t.add_review("Cafe X", 4, "great coffee");
        t.add_review("Cafe X", 2, "slow service");
        assert_eq!(t.restaurants().get("Cafe X").unwrap().rating(), 3.0);

        let four = t
            .reviews()
            .for_restaurant("Cafe X")
            .into_iter()
            .find(|r| r.rating().get() == 4)
            .unwrap();
        t.reviews().delete(four.id().unwrap()).unwrap();
        assert_eq!(t.restaurants().get("Cafe X").unwrap().rating(), 2.0);

        t.restaurants().delete("Cafe X").unwrap();
        assert!(t.restaurants().get("Cafe X").is_none());
        assert!(t.reviews().for_restaurant("Cafe X").is_empty());
        assert!(t.backend.snapshot().reviews.is_empty());
    });
}

#[test]
fn duplicate_names_are_case_sensitive() {
    with_test_context(|t| {
        t.add_restaurant("Cafe X", "Downtown");
        let err = t
            .restaurants()
            .add(Restaurant::new("Cafe X", "Uptown").unwrap())
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::DuplicateKey {
                entity: EntityKind::Restaurant,
                ..
            }
        ));
        assert_eq!(t.restaurants().len(), 1);

        t.add_restaurant("cafe x", "Uptown");
        assert_eq!(t.restaurants().len(), 2);
    });
}

#[test]
fn rename_keeps_reviews_attached() {
    with_test_context(|t| {
        t.add_restaurant("Old Name", "Harbour");
        t.add_review("Old Name", 5, "");

        let mut renamed = t.restaurants().get("Old Name").unwrap();
        renamed.rename("New Name").unwrap();
        t.restaurants().update(&renamed).unwrap();

        assert!(t.reviews().for_restaurant("Old Name").is_empty());
        let reviews = t.reviews().for_restaurant("New Name");
        assert_eq!(reviews.len(), 1);
        assert_eq!(
            t.reviews().restaurant_name(&reviews[0]).as_deref(),
            Some("New Name")
        );
        assert_eq!(t.restaurants().get("New Name").unwrap().rating(), 5.0);
    });
}

#[test]
fn average_rating_matches_cached_rating() {
    with_test_context(|t| {
        t.seed(1, 7);
        let name = "Restaurant 0";
        let average = t.reviews().average_rating(name).unwrap();
        assert_eq!(average, t.restaurants().get(name).unwrap().rating());
        assert!(matches!(
            t.reviews().average_rating("Nowhere"),
            Err(CoreError::NotFound { .. })
        ));
    });
}

#[test]
fn out_of_band_rating_drift_is_repaired_on_reload() {
    with_test_context(|t| {
        t.add_restaurant("Drift", "Somewhere");
        t.add_review("Drift", 3, "");

        let mut tables = t.backend.snapshot();
        for r in tables.restaurants.values_mut() {
            r.set_rating(4.9);
        }
        t.backend.replace(tables);

        let summary = t.caches().reload_all().unwrap();
        assert_eq!(summary.ratings_fixed, 1);
        assert_eq!(t.restaurants().get("Drift").unwrap().rating(), 3.0);
        let stored = t.backend.snapshot();
        assert_eq!(stored.restaurants.values().next().unwrap().rating(), 3.0);
    });
}

#[test]
fn change_feed_reports_cascade() {
    with_test_context(|t| {
        t.add_restaurant("Feed", "Street");
        t.add_review("Feed", 2, "");
        let events = t.feed().subscribe();

        t.restaurants().delete("Feed").unwrap();
        let seen: Vec<_> = events.try_iter().collect();
        assert!(seen
            .iter()
            .any(|e| e.entity == EntityKind::Review && e.kind == ChangeKind::Delete));
        assert!(seen
            .iter()
            .any(|e| e.entity == EntityKind::Restaurant && e.key == "Feed"));
    });
}

#[test]
fn review_for_missing_restaurant_is_not_found() {
    with_test_context(|t| {
        let err = t
            .reviews()
            .add("Ghost", Rating::new(3).unwrap(), "")
            .unwrap_err();
        assert!(err.is_user_correctable());
        assert!(t.reviews().is_empty());
    });
}

#[test]
fn reload_after_outage_reports_sync_status() {
    with_test_context(|t| {
        t.seed(2, 1);
        t.handle().close();
        t.backend.set_offline(true);
        let err = t.caches().reload_all().unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            t.restaurants().sync_status(),
            SyncStatus::Failed { .. }
        ));
        assert!(t.restaurants().is_empty());

        t.backend.set_offline(false);
        let summary = t.caches().reload_all().unwrap();
        assert_eq!(summary.restaurants, 2);
        assert!(t.restaurants().sync_status().is_synced());
    });
}

#[test]
fn reviews_survive_restaurant_id_lookup() {
    with_test_context(|t| {
        let saved = t.add_restaurant("Lookup", "Lane");
        let id: RestaurantId = saved.id().unwrap();
        t.add_review("Lookup", 1, "");
        assert_eq!(t.reviews().for_restaurant_id(id).len(), 1);
        assert_eq!(t.restaurants().find_by_id(id).unwrap().name(), "Lookup");
    });
}
