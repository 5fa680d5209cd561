//! Tests for the EllipticSum state checksum

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::traits::Identity;
use meridian_crypto::{hash_to_point, ChecksumError, EllipticSum};
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

#[tokio::test]
async fn empty_checksum_is_identity() {
    let sum = EllipticSum::new();
    let digest = sum.to_bytes().await.unwrap();
    assert_eq!(digest, RistrettoPoint::identity().compress().to_bytes());
}

#[tokio::test]
async fn digest_is_order_independent() {
    let forward = EllipticSum::new();
    forward.add(b"hello".to_vec()).await.unwrap();
    forward.add(b"world".to_vec()).await.unwrap();
    let d1 = forward.to_bytes().await.unwrap();
    assert_ne!(d1, RistrettoPoint::identity().compress().to_bytes());

    let reversed = EllipticSum::new();
    reversed.add(b"world".to_vec()).await.unwrap();
    reversed.add(b"hello".to_vec()).await.unwrap();
    assert_eq!(reversed.to_bytes().await.unwrap(), d1);
}

#[tokio::test]
async fn permutations_converge() {
    let inputs: Vec<Vec<u8>> = (0u8..6).map(|i| vec![i; 8]).collect();

    let reference = EllipticSum::new();
    for input in &inputs {
        reference.add(input.clone()).await.unwrap();
    }
    let expected = reference.to_bytes().await.unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    for _ in 0..5 {
        let mut shuffled = inputs.clone();
        for i in (1..shuffled.len()).rev() {
            shuffled.swap(i, rng.gen_range(0..=i));
        }
        let sum = EllipticSum::new();
        for input in shuffled {
            sum.add(input).await.unwrap();
        }
        assert_eq!(sum.to_bytes().await.unwrap(), expected);
    }
}

#[tokio::test]
async fn remove_cancels_add() {
    let sum = EllipticSum::new();
    sum.add(b"x".to_vec()).await.unwrap();
    sum.add(b"y".to_vec()).await.unwrap();
    sum.remove(b"x".to_vec()).await.unwrap();

    let only_y = EllipticSum::new();
    only_y.add(b"y".to_vec()).await.unwrap();

    assert_eq!(
        sum.to_bytes().await.unwrap(),
        only_y.to_bytes().await.unwrap()
    );
}

#[tokio::test]
async fn add_then_remove_returns_to_identity() {
    let sum = EllipticSum::new();
    sum.add(b"transient".to_vec()).await.unwrap();
    sum.remove(b"transient".to_vec()).await.unwrap();
    assert_eq!(
        sum.to_bytes().await.unwrap(),
        RistrettoPoint::identity().compress().to_bytes()
    );
}

#[tokio::test]
async fn digest_is_deterministic_across_instances() {
    let a = EllipticSum::new();
    a.add(b"record".to_vec()).await.unwrap();

    let b = EllipticSum::new();
    b.add(b"record".to_vec()).await.unwrap();

    assert_eq!(a.to_bytes().await.unwrap(), b.to_bytes().await.unwrap());
}

#[test]
fn random_inputs_map_to_distinct_points() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut seen = HashSet::new();
    for _ in 0..200 {
        let mut input = [0u8; 32];
        rng.fill(&mut input);
        let point = hash_to_point(&input).compress().to_bytes();
        assert!(seen.insert(point), "hash collision on random input");
    }
}

#[tokio::test]
async fn wait_drains_scheduled_updates() {
    let sum = EllipticSum::new();
    // Saturate the pool well past its size; wait must observe all of them.
    let expected = {
        let reference = EllipticSum::new();
        for i in 0u32..64 {
            reference.add(i.to_be_bytes().to_vec()).await.unwrap();
        }
        reference.to_bytes().await.unwrap()
    };
    for i in 0u32..64 {
        sum.add(i.to_be_bytes().to_vec()).await.unwrap();
    }
    sum.wait().await.unwrap();
    assert_eq!(sum.to_bytes().await.unwrap(), expected);
}

#[tokio::test]
async fn closed_pool_fails_with_scheduling_error() {
    let sum = EllipticSum::new();
    sum.add(b"before".to_vec()).await.unwrap();
    sum.close();

    assert!(matches!(
        sum.add(b"after".to_vec()).await,
        Err(ChecksumError::Scheduling)
    ));
    assert!(matches!(sum.wait().await, Err(ChecksumError::Scheduling)));
}
