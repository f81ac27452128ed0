//! Property-based tests for the core accounting math.
//!
//! These verify the engine's arithmetic invariants under random inputs:
//! P&L symmetry, the average-price law, funding symmetry on a balanced book,
//! tax clamps, LP share monotonicity and buffer-stream conservation.

use perps_engine::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// Strategies for generating test data
fn price_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..1_000_000i64).prop_map(|x| Decimal::new(x, 2)) // $0.01 to $10,000
}

fn size_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..10_000_000i64).prop_map(|x| Decimal::new(x, 2))
}

fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..100_000_000i64).prop_map(|x| Decimal::new(x, 2))
}

fn upl_strategy() -> impl Strategy<Value = Decimal> {
    (-50_000_000i64..50_000_000i64).prop_map(|x| Decimal::new(x, 2))
}

proptest! {
    /// P&L is zero when the close price equals entry and no funding accrued.
    #[test]
    fn pnl_zero_at_entry(
        size in size_strategy(),
        entry in price_strategy(),
    ) {
        let entry_price = Price::new_unchecked(entry);
        let (pnl, funding) = position_pnl(
            Side::Long,
            entry_price,
            entry_price,
            Amount::new(size),
            Decimal::ZERO,
            Decimal::ZERO,
        );
        prop_assert_eq!(pnl, Decimal::ZERO);
        prop_assert_eq!(funding, Decimal::ZERO);
    }

    /// Long and short P&L are exact mirrors for the same price move.
    #[test]
    fn pnl_mirrors_across_sides(
        size in size_strategy(),
        entry in price_strategy(),
        mark in price_strategy(),
    ) {
        let entry_price = Price::new_unchecked(entry);
        let mark_price = Price::new_unchecked(mark);
        let size = Amount::new(size);

        let (long_pnl, _) = position_pnl(
            Side::Long, mark_price, entry_price, size, Decimal::ZERO, Decimal::ZERO,
        );
        let (short_pnl, _) = position_pnl(
            Side::Short, mark_price, entry_price, size, Decimal::ZERO, Decimal::ZERO,
        );
        prop_assert_eq!(long_pnl, -short_pnl);

        if mark > entry {
            prop_assert!(long_pnl > Decimal::ZERO);
        } else if mark < entry {
            prop_assert!(long_pnl < Decimal::ZERO);
        }
    }

    /// Average price law: two increases land exactly on the weighted mean.
    #[test]
    fn average_price_law(
        s1 in size_strategy(),
        s2 in size_strategy(),
        p1 in price_strategy(),
        p2 in price_strategy(),
    ) {
        let avg = average_entry_price(
            Amount::new(s1),
            Price::new_unchecked(p1),
            Amount::new(s2),
            Price::new_unchecked(p2),
        );
        let expected = (s1 * p1 + s2 * p2) / (s1 + s2);
        prop_assert_eq!(avg.value(), expected);
    }

    /// A balanced book accrues exactly zero funding for any interval count.
    #[test]
    fn funding_symmetry_on_balanced_book(
        oi_size in size_strategy(),
        intervals in 1i64..100_000,
        factor in 1u32..10_000,
    ) {
        let mut oi = OpenInterest::zero();
        oi.increment(Side::Long, Amount::new(oi_size));
        oi.increment(Side::Short, Amount::new(oi_size));

        let accrued = accrued_funding(Bps::new(factor), &oi, intervals, 3_600);
        prop_assert_eq!(accrued, Decimal::ZERO);
    }

    /// Funding magnitude never exceeds the fully-skewed rate.
    #[test]
    fn funding_bounded_by_full_skew(
        long in size_strategy(),
        short in size_strategy(),
        intervals in 1i64..8_760,
        factor in 1u32..10_000,
    ) {
        let mut oi = OpenInterest::zero();
        oi.increment(Side::Long, Amount::new(long));
        oi.increment(Side::Short, Amount::new(short));

        let accrued = accrued_funding(Bps::new(factor), &oi, intervals, 3_600);

        let mut full = OpenInterest::zero();
        full.increment(Side::Long, Amount::new(long + short));
        let cap = accrued_funding(Bps::new(factor), &full, intervals, 3_600);

        prop_assert!(accrued.abs() <= cap);
    }

    /// Open interest counters never go negative.
    #[test]
    fn open_interest_never_negative(
        ops in proptest::collection::vec((any::<bool>(), any::<bool>(), 1i64..1_000_000), 1..50),
    ) {
        let mut oi = OpenInterest::zero();
        for (is_long, is_increment, raw) in ops {
            let side = if is_long { Side::Long } else { Side::Short };
            let size = Amount::new(Decimal::new(raw, 2));
            if is_increment {
                oi.increment(side, size);
            } else {
                oi.decrement(side, size);
            }
            prop_assert!(oi.long >= Decimal::ZERO);
            prop_assert!(oi.short >= Decimal::ZERO);
        }
    }

    /// Both taxes stay inside [0, BPS] for any pool state.
    #[test]
    fn tax_clamp(
        balance in amount_strategy(),
        buffer in amount_strategy(),
        upl in upl_strategy(),
        amount in amount_strategy(),
    ) {
        let mut pool = PoolState::new();
        pool.balance = Amount::new(balance);
        pool.buffer = Amount::new(buffer);
        pool.global_upl = upl;

        let deposit = pool.deposit_tax(Amount::new(amount));
        let withdrawal = pool.withdrawal_tax(Amount::new(amount));
        prop_assert!(deposit.value() <= BPS);
        prop_assert!(withdrawal.value() <= BPS);
    }

    /// With non-positive UPL and no withdrawals, a new deposit never lowers
    /// an existing holder's claim.
    #[test]
    fn lp_claim_monotonic_under_deposits(
        initial in 1_000i64..10_000_000,
        buffer in 0i64..1_000_000,
        upl_neg in 0i64..1_000_000,
        deposit in 1i64..10_000_000,
    ) {
        let mut pool = PoolState::new();
        let first = Amount::new(Decimal::from(initial));
        pool.mint_lp(UserId(1), first);
        pool.balance = first;
        pool.buffer = Amount::new(Decimal::from(buffer));
        pool.global_upl = -Decimal::from(upl_neg);

        let claim_before = pool.lp_value_of(UserId(1));

        // execute a taxed deposit the way the engine does
        let amount = Amount::new(Decimal::from(deposit));
        let tax = pool.deposit_tax(amount);
        prop_assume!(tax.value() < BPS);
        let after_tax = amount.mul(tax.complement_fraction());
        pool.mint_lp(UserId(2), after_tax);
        pool.balance = pool.balance.add(amount);

        let claim_after = pool.lp_value_of(UserId(1));
        // decimal division wobbles in the last digit; allow an epsilon
        prop_assert!(
            claim_after.value() >= claim_before.value() - dec!(0.000001),
            "claim shrank: {} -> {}", claim_before, claim_after
        );
    }

    /// Streaming moves value from buffer to principal and conserves the sum.
    #[test]
    fn buffer_stream_conserves_value(
        buffer in amount_strategy(),
        balance in amount_strategy(),
        epoch_committed in 0i64..100_000_000,
        last_paid in 0i64..2_000_000,
        now_offset in 0i64..2_000_000,
        period_hours in 1i64..168,
    ) {
        let period = period_hours * 3_600;
        let mut pool = PoolState::new();
        pool.balance = Amount::new(balance);
        pool.buffer = Amount::new(buffer);
        // committed pot never exceeds the buffer in real flows
        pool.epoch_remaining = Amount::new(Decimal::new(epoch_committed, 2)).min(pool.buffer);
        pool.last_paid = Timestamp::from_secs(last_paid);

        let total_before = pool.balance.value() + pool.buffer.value();
        let moved = pool.stream_buffer(Timestamp::from_secs(last_paid + now_offset), period);

        prop_assert!(moved.value() >= Decimal::ZERO);
        prop_assert!(pool.buffer.value() >= Decimal::ZERO);
        prop_assert_eq!(
            pool.balance.value() + pool.buffer.value(),
            total_before
        );
        prop_assert!(pool.epoch_remaining <= pool.buffer);
    }

    /// Every stored position satisfies the leverage bounds.
    #[test]
    fn stored_positions_respect_leverage_bounds(
        margin_raw in 100i64..100_000,
        lev in 1i64..50,
    ) {
        let mut ledger = MemoryLedger::new();
        ledger.mint(AssetId(1), UserId(2), Amount::new(dec!(100_000_000)));

        let mut reference = MemoryReferenceFeed::new();
        reference.push(Market::eth_usd().reference_feed_id, Price::new(dec!(2_000)));

        let mut engine = Engine::new(
            EngineConfig::default(),
            Box::new(ledger),
            Box::new(MemoryPriceFeed::new()),
            Box::new(reference),
        ).unwrap();
        engine.set_asset(AssetId(1), Asset::usdc()).unwrap();
        engine
            .set_market(MarketId::from_tag("ETH-USD"), Market::eth_usd())
            .unwrap();
        engine.add_keeper(UserId(90));
        engine.set_time(Timestamp::from_secs(1_000));

        let margin = Decimal::from(margin_raw);
        let size = margin * Decimal::from(lev);
        let ids = engine.submit_order(
            UserId(2),
            OrderRequest {
                user: UserId(2),
                asset: AssetId(1),
                market: MarketId::from_tag("ETH-USD"),
                side: Side::Long,
                margin: Amount::new(margin),
                size: Amount::new(size),
                kind: OrderKind::Market,
                reduce_only: false,
                trigger_price: None,
                expiry: None,
                cancel_on_execute: None,
                trailing_stop: None,
            },
            Attached::none(),
            None,
            None,
        ).unwrap();

        engine.advance_time(1);
        let payload = encode_updates(&[PriceUpdate {
            feed_id: Market::eth_usd().oracle_feed_id,
            quote: OracleQuote::new(200_000, 0, -2, engine.time()),
        }]);
        engine.execute_orders(UserId(90), &ids, &payload).unwrap();

        for position in engine.positions_page(0, usize::MAX) {
            let leverage = position.leverage();
            prop_assert!(leverage >= Decimal::ONE);
            prop_assert!(leverage <= Market::eth_usd().max_leverage);
        }
    }
}
