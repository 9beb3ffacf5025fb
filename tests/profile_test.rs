//! Profile routing and invalidation (spec §4.4): a frequently-queried
//! signature earns a materialized ghost rollup, and a later structural
//! dimension mutation must invalidate it rather than serve a stale
//! aggregate.

use menger::prelude::*;
use menger::model::dimension::coord;

fn cube_space() -> Space {
    Space::new(
        "Cube",
        vec![DimensionDef::tree("place", vec!["Region", "Country", "City"], ScalarType::String).unwrap()],
        vec![Measure::sum("total", ScalarType::Float)],
    )
    .unwrap()
}

fn number(cell: &Cell) -> f64 {
    match cell {
        Cell::Number(n) => *n,
        other => panic!("expected a number cell, got {other:?}"),
    }
}

fn region_totals(rows: &[Vec<Cell>]) -> Vec<(String, f64)> {
    let mut out: Vec<(String, f64)> = rows
        .iter()
        .map(|row| {
            let Cell::Coord(c) = &row[0] else { panic!("expected a coordinate cell") };
            (c[0].to_string(), number(&row[1]))
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

#[test]
fn reparent_after_profile_registration_does_not_serve_a_stale_rollup() {
    let mut ctx = Context::connect("sqlite://:memory:").unwrap();
    let space = cube_space();
    ctx.register_space(space.clone()).unwrap();

    let points = vec![
        LoadPoint { coords: vec![coord::<&str>(["EU", "BE", "BRU"])], values: vec![10.0] },
        LoadPoint { coords: vec![coord::<&str>(["USA", "NYC", "JFK"])], values: vec![5.0] },
    ];
    space.load(&mut ctx, &points, None, LoadType::Default).unwrap();

    let select = vec![SelectItem::Level("place".into(), LevelSpec::Name("Region".into())), SelectItem::Measure("total".into())];

    // Cross the registration threshold so a Region-level rollup is
    // materialized into a ghost space.
    let mut before = Vec::new();
    for _ in 0..10 {
        before = space.dice(&mut ctx, &select, &Vec::new(), None, None).unwrap();
    }
    assert_eq!(region_totals(&before), vec![("EU".to_string(), 10.0), ("USA".to_string(), 5.0)]);

    // Move JFK from under USA/NYC to under EU/BE: a structural mutation
    // that changes which region JFK's fact row rolls up under.
    ctx.reparent("place", &coord::<&str>(["USA", "NYC", "JFK"]), &coord::<&str>(["EU", "BE"])).unwrap();

    let after = space.dice(&mut ctx, &select, &Vec::new(), None, None).unwrap();
    assert_eq!(region_totals(&after), vec![("EU".to_string(), 15.0)]);
}
