//! This module is an integration test that mines the behavioural invariants
//! of a small token's `burn` function and then uses them as a runtime oracle
//! against both a consistent and an inconsistent transaction.
#![cfg(test)]

mod common;

#[test]
fn mines_generalised_burn_invariants() -> anyhow::Result<()> {
    let mut analysis = common::new_analysis(2)?;

    // Three burns by different holders of different amounts, so relations
    // tied to one holder or one amount cannot survive.
    analysis.observe(&common::consistent_burn(1, 0xa0, 7)?);
    analysis.observe(&common::consistent_burn(2, 0xa1, 8)?);
    analysis.observe(&common::consistent_burn(3, 0xa2, 9)?);

    let invariants = analysis.mine()?;
    let bucket = format!("{}.burn(address,uint256)", common::watched());
    let names: Vec<&str> = invariants.buckets[&bucket]
        .iter()
        .map(|inv| inv.name.as_str())
        .collect();

    // The conservation law survives in its generalised form.
    assert!(names.contains(&"change.post(variable.balances.SUM) == - (method.amount)"));
    assert!(names.contains(
        &"change.post(variable.balances.SUM) == change.post(variable.balances[method.from])"
    ));
    assert!(names.contains(&"pre(variable.total) == 1000"));

    // Nothing tied to a specific holder or amount remains.
    assert!(!names.iter().any(|name| name.contains("balances[0x00")));
    assert!(!names.iter().any(|name| name.starts_with("method.amount ==")));

    Ok(())
}

#[test]
fn consistent_transactions_pass_the_oracle() -> anyhow::Result<()> {
    let mut analysis = common::new_analysis(2)?;
    analysis.observe(&common::consistent_burn(1, 0xa0, 7)?);
    analysis.observe(&common::consistent_burn(2, 0xa1, 8)?);
    analysis.observe(&common::consistent_burn(3, 0xa2, 9)?);
    let invariants = analysis.mine()?;

    let clean = common::consistent_burn(99, 0xa5, 4)?;
    assert!(analysis.check(&invariants, &clean).is_empty());

    Ok(())
}

#[test]
fn inconsistent_burns_are_flagged() -> anyhow::Result<()> {
    let mut analysis = common::new_analysis(2)?;
    analysis.observe(&common::consistent_burn(1, 0xa0, 7)?);
    analysis.observe(&common::consistent_burn(2, 0xa1, 8)?);
    analysis.observe(&common::consistent_burn(3, 0xa2, 9)?);
    let invariants = analysis.mine()?;

    // The holder loses one more token than the call burns.
    let broken = common::burn_transaction(&common::Burn {
        block: 99,
        from: common::holder(0xb0),
        amount: 9,
        pre_balance: 100,
        post_balance: 90,
        pre_total: 1000,
        post_total: 991,
    })?;

    let violations = analysis.check(&invariants, &broken);
    assert_eq!(violations.len(), 2);

    let function = violations
        .iter()
        .find(|v| v.trace.ends_with(":function"))
        .expect("a function-level violation");
    assert_eq!(function.trace, "99_0_0:function");
    assert_eq!(
        function.bucket,
        format!("{}.burn(address,uint256)", common::watched())
    );
    assert_eq!(function.sender, common::caller());
    assert!(function
        .violated
        .contains(&"change.post(variable.balances.SUM) == - (method.amount)".to_owned()));

    let contract = violations
        .iter()
        .find(|v| v.trace.ends_with(":contract"))
        .expect("a contract-level violation");
    assert_eq!(contract.bucket, common::watched().to_string());

    Ok(())
}

#[test]
fn checking_does_not_disturb_the_accumulated_state() -> anyhow::Result<()> {
    let mut analysis = common::new_analysis(2)?;
    analysis.observe(&common::consistent_burn(1, 0xa0, 7)?);
    analysis.observe(&common::consistent_burn(2, 0xa1, 8)?);
    let invariants = analysis.mine()?;

    let recorded = analysis.traces().len();
    analysis.check(&invariants, &common::consistent_burn(50, 0xa9, 3)?);
    assert_eq!(analysis.traces().len(), recorded);

    Ok(())
}
