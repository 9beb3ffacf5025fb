//! Structural dimension maintenance scenarios (spec §8): `glob`, `reparent`,
//! `rename` with its automatic duplicate merge.

use menger::prelude::*;
use menger::model::dimension::coord;

fn cube_space() -> Space {
    Space::new(
        "Cube",
        vec![
            DimensionDef::date("date"),
            DimensionDef::tree("place", vec!["Region", "Country", "City"], ScalarType::String).unwrap(),
        ],
        vec![Measure::sum("total", ScalarType::Float), Measure::sum("count", ScalarType::Float)],
    )
    .unwrap()
}

fn load_cube(ctx: &mut Context, space: &Space) {
    let points = vec![
        LoadPoint {
            coords: vec![coord::<i64>([2014, 1, 1]), coord::<&str>(["EU", "BE", "BRU"])],
            values: vec![2.0, 1.0],
        },
        LoadPoint {
            coords: vec![coord::<i64>([2014, 1, 2]), coord::<&str>(["EU", "BE", "CRL"])],
            values: vec![4.0, 1.0],
        },
        LoadPoint {
            coords: vec![coord::<i64>([2014, 1, 1]), coord::<&str>(["EU", "FR", "ORY"])],
            values: vec![8.0, 1.0],
        },
        LoadPoint {
            coords: vec![coord::<i64>([2014, 1, 2]), coord::<&str>(["USA", "NYC", "JFK"])],
            values: vec![16.0, 1.0],
        },
    ];
    space.load(ctx, &points, None, LoadType::Default).unwrap();
}

fn names(atoms: &[Atom]) -> Vec<String> {
    atoms.iter().map(|a| a.to_string()).collect()
}

#[test]
fn glob_resolves_wildcard_patterns_to_concrete_coordinates() {
    let mut ctx = Context::connect("sqlite://:memory:").unwrap();
    let space = cube_space();
    ctx.register_space(space.clone()).unwrap();
    load_cube(&mut ctx, &space);

    // date.glob((None, 1, None)) -> every day under every year's month 1.
    let pattern = vec![None, Some(Atom::from(1i64)), None];
    let mut matches = ctx.glob("date", &pattern, &[]).unwrap();
    matches.sort();
    assert_eq!(matches, vec![coord::<i64>([2014, 1, 1]), coord::<i64>([2014, 1, 2])]);

    // date.glob((2014, None)) -> the one month under year 2014.
    let pattern = vec![Some(Atom::from(2014i64)), None];
    let matches = ctx.glob("date", &pattern, &[]).unwrap();
    assert_eq!(matches, vec![coord::<i64>([2014, 1])]);
}

#[test]
fn explode_splits_a_pattern_into_its_resolved_prefix_and_remaining_depth() {
    let mut ctx = Context::connect("sqlite://:memory:").unwrap();
    let space = cube_space();
    ctx.register_space(space.clone()).unwrap();
    load_cube(&mut ctx, &space);

    // (2014, None, None) -> the Year node, 2 levels short of Day.
    let pattern = vec![Some(Atom::from(2014i64)), None, None];
    let (key, remaining) = ctx.explode("date", &pattern).unwrap();
    assert_eq!(remaining, 2);
    let year_children = ctx.drill("date", &coord::<i64>([2014])).unwrap();
    assert!(!year_children.is_empty());
    let direct_key = ctx.glob("date", &[Some(Atom::from(2014i64))], &[]).unwrap();
    assert_eq!(direct_key, vec![coord::<i64>([2014])]);
    let _ = key;

    // A fully-resolved pattern has zero remaining depth.
    let full = vec![Some(Atom::from(2014i64)), Some(Atom::from(1i64)), Some(Atom::from(1i64))];
    let (_, remaining) = ctx.explode("date", &full).unwrap();
    assert_eq!(remaining, 0);
}

#[test]
fn reparent_moves_a_subtree_without_changing_the_grand_total() {
    let mut ctx = Context::connect("sqlite://:memory:").unwrap();
    let space = cube_space();
    ctx.register_space(space.clone()).unwrap();
    load_cube(&mut ctx, &space);

    ctx.reparent("place", &coord::<&str>(["EU", "BE", "CRL"]), &coord::<&str>(["EU", "FR"])).unwrap();

    let under_fr = ctx.drill("place", &coord::<&str>(["EU", "FR"])).unwrap();
    assert_eq!(names(&under_fr), vec!["CRL", "ORY"]);

    let under_be = ctx.drill("place", &coord::<&str>(["EU", "BE"])).unwrap();
    assert_eq!(names(&under_be), vec!["BRU"]);

    let select = vec![SelectItem::Measure("total".into())];
    let rows = space.dice(&mut ctx, &select, &Vec::new(), None, None).unwrap();
    assert_eq!(rows.len(), 1);
    match &rows[0][0] {
        Cell::Number(n) => assert_eq!(*n, 30.0),
        other => panic!("expected a number cell, got {other:?}"),
    }
}

#[test]
fn rename_onto_an_existing_sibling_auto_merges_and_keeps_the_smaller_id() {
    let mut ctx = Context::connect("sqlite://:memory:").unwrap();
    let space = cube_space();
    ctx.register_space(space.clone()).unwrap();
    load_cube(&mut ctx, &space);

    // BRU was loaded before CRL, so it holds the smaller id and survives the merge.
    ctx.rename("place", &coord::<&str>(["EU", "BE", "BRU"]), Atom::from("CRL")).unwrap();

    let under_be = ctx.drill("place", &coord::<&str>(["EU", "BE"])).unwrap();
    assert_eq!(names(&under_be), vec!["CRL"]);

    let select = vec![
        SelectItem::Level("place".into(), LevelSpec::Name("City".into())),
        SelectItem::Measure("total".into()),
    ];
    let filters = vec![Clause { dimension: "place".into(), coords: vec![coord::<&str>(["EU", "BE"])], depth: None }];
    let rows = space.dice(&mut ctx, &select, &filters, None, None).unwrap();

    assert_eq!(rows.len(), 1);
    match &rows[0][0] {
        Cell::Coord(c) => assert_eq!(names(c), vec!["EU", "BE", "CRL"]),
        other => panic!("expected a coordinate cell, got {other:?}"),
    }
    match &rows[0][1] {
        Cell::Number(n) => assert_eq!(*n, 6.0),
        other => panic!("expected a number cell, got {other:?}"),
    }
}

#[test]
fn search_matches_by_substring_within_a_depth_bound() {
    let mut ctx = Context::connect("sqlite://:memory:").unwrap();
    let space = cube_space();
    ctx.register_space(space.clone()).unwrap();
    load_cube(&mut ctx, &space);

    let hits = ctx.search("place", "BRU", 3).unwrap();
    assert_eq!(hits, vec![(Atom::from("BRU"), 3)]);

    // BRU only exists at depth 3 (City); a shallower bound excludes it.
    let hits = ctx.search("place", "BRU", 2).unwrap();
    assert!(hits.is_empty());

    // A substring shared by Region and Country names surfaces both, ordered by depth.
    let hits = ctx.search("place", "E", 3).unwrap();
    assert_eq!(hits, vec![(Atom::from("EU"), 1), (Atom::from("BE"), 2)]);
}
