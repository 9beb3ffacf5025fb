//! Store state survives a clean close and a fresh `Context::connect` against
//! the same file (spec §1 "consistent ... across repeated opens of the
//! persistent store").

use menger::prelude::*;
use menger::model::dimension::coord;

fn place_space() -> Space {
    Space::new(
        "Cube",
        vec![DimensionDef::tree("place", vec!["Region", "Country"], ScalarType::String).unwrap()],
        vec![Measure::sum("total", ScalarType::Float)],
    )
    .unwrap()
}

#[test]
fn facts_and_dimension_nodes_survive_a_commit_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cube.db");
    let uri = format!("sqlite://{}", path.display());

    {
        let mut ctx = Context::connect(&uri).unwrap();
        let space = place_space();
        ctx.register_space(space.clone()).unwrap();
        let points = vec![LoadPoint { coords: vec![coord::<&str>(["EU", "BE"])], values: vec![10.0] }];
        space.load(&mut ctx, &points, None, LoadType::Default).unwrap();
        ctx.commit().unwrap();
    }

    {
        let mut ctx = Context::connect(&uri).unwrap();
        let space = place_space();
        ctx.register_space(space.clone()).unwrap();

        assert!(ctx.contains("place", &coord::<&str>(["EU", "BE"])).unwrap());

        let rows = space.dice(&mut ctx, &[SelectItem::Measure("total".into())], &Vec::new(), None, None).unwrap();
        assert_eq!(rows.len(), 1);
        match &rows[0][0] {
            Cell::Number(n) => assert_eq!(*n, 10.0),
            other => panic!("expected a number cell, got {other:?}"),
        }
        ctx.commit().unwrap();
    }
}

#[test]
fn a_readonly_reopen_does_not_create_tables_but_can_still_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cube.db");
    let uri = format!("sqlite://{}", path.display());

    {
        let mut ctx = Context::connect(&uri).unwrap();
        let space = place_space();
        ctx.register_space(space.clone()).unwrap();
        let points = vec![LoadPoint { coords: vec![coord::<&str>(["EU", "BE"])], values: vec![10.0] }];
        space.load(&mut ctx, &points, None, LoadType::Default).unwrap();
        ctx.commit().unwrap();
    }

    let ro_uri = format!("{uri}?readonly=true");
    let mut ctx = Context::connect(&ro_uri).unwrap();
    assert!(ctx.is_readonly());
    let space = place_space();
    ctx.register_space(space.clone()).unwrap();

    assert!(ctx.contains("place", &coord::<&str>(["EU", "BE"])).unwrap());
    ctx.rollback().unwrap();
}
