//! Version dimension default-to-latest behavior (spec §3, §4.3 step 3, §8
//! scenario 7).

use menger::prelude::*;
use menger::model::dimension::coord;

fn versioned_space() -> Space {
    Space::new(
        "VCube",
        vec![DimensionDef::version("version", ScalarType::String).unwrap()],
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

#[test]
fn dice_without_projecting_version_implicitly_filters_to_the_latest() {
    let mut ctx = Context::connect("sqlite://:memory:").unwrap();
    let space = versioned_space();
    ctx.register_space(space.clone()).unwrap();

    let points = vec![
        LoadPoint { coords: vec![coord::<&str>(["2015-01"])], values: vec![30.0] },
        LoadPoint { coords: vec![coord::<&str>(["2015-02"])], values: vec![300.0] },
    ];
    space.load(&mut ctx, &points, None, LoadType::Default).unwrap();

    let rows = space.dice(&mut ctx, &[SelectItem::Measure("total".into())], &Vec::new(), None, None).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(number(&rows[0][0]), 300.0);
}

#[test]
fn dice_projecting_version_returns_every_version_row() {
    let mut ctx = Context::connect("sqlite://:memory:").unwrap();
    let space = versioned_space();
    ctx.register_space(space.clone()).unwrap();

    let points = vec![
        LoadPoint { coords: vec![coord::<&str>(["2015-01"])], values: vec![30.0] },
        LoadPoint { coords: vec![coord::<&str>(["2015-02"])], values: vec![300.0] },
    ];
    space.load(&mut ctx, &points, None, LoadType::Default).unwrap();

    let select = vec![SelectItem::Dimension("version".into()), SelectItem::Measure("total".into())];
    let rows = space.dice(&mut ctx, &select, &Vec::new(), None, None).unwrap();

    let mut got: Vec<(String, f64)> = rows
        .iter()
        .map(|row| {
            let Cell::Coord(c) = &row[0] else { panic!("expected a coordinate cell") };
            (c[0].to_string(), number(&row[1]))
        })
        .collect();
    got.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(got, vec![("2015-01".to_string(), 30.0), ("2015-02".to_string(), 300.0)]);
}

#[test]
fn an_explicit_filter_on_version_overrides_the_latest_default() {
    let mut ctx = Context::connect("sqlite://:memory:").unwrap();
    let space = versioned_space();
    ctx.register_space(space.clone()).unwrap();

    let points = vec![
        LoadPoint { coords: vec![coord::<&str>(["2015-01"])], values: vec![30.0] },
        LoadPoint { coords: vec![coord::<&str>(["2015-02"])], values: vec![300.0] },
    ];
    space.load(&mut ctx, &points, None, LoadType::Default).unwrap();

    let filters = vec![Clause { dimension: "version".into(), coords: vec![coord::<&str>(["2015-01"])], depth: None }];
    let rows = space.dice(&mut ctx, &[SelectItem::Measure("total".into())], &filters, None, None).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(number(&rows[0][0]), 30.0);
}
