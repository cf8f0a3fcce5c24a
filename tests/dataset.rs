use mapbayes::prelude::*;
use mapbayes::read_nonmem;

fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_read_nonmem_single_subject() {
    let path = write_temp(
        "mapbayes_single.csv",
        "ID,TIME,DV,AMT,EVID,DUR,WT\n\
         1,0,.,2000,1,.,70\n\
         1,1,25.0,.,0,.,70\n\
         1,14,5.5,.,0,.,70\n",
    );

    let subjects = read_nonmem(path.to_str().unwrap()).unwrap();
    assert_eq!(subjects.len(), 1);

    let subject = &subjects[0];
    assert_eq!(subject.id(), "1");
    assert_eq!(subject.n_occasions(), 1);
    assert_eq!(subject.observations().len(), 2);

    // WT is not a reserved column, so it lands as a covariate.
    let occasion = &subject.occasions()[0];
    assert_eq!(occasion.covariates().interpolate("wt", 5.0), Some(70.0));
}

#[test]
fn test_read_nonmem_occasions_and_endpoints() {
    let path = write_temp(
        "mapbayes_occ.csv",
        "ID,TIME,DV,AMT,EVID,OCC,DVID\n\
         1,0,.,1000,1,1,.\n\
         1,1,12.0,.,0,1,conc\n\
         1,1,0.8,.,0,1,effect\n\
         1,24,.,1000,1,2,.\n\
         1,25,13.0,.,0,2,conc\n",
    );

    let subjects = read_nonmem(path.to_str().unwrap()).unwrap();
    let subject = &subjects[0];

    assert_eq!(subject.n_occasions(), 2);
    assert_eq!(subject.endpoints().len(), 2);
    assert_eq!(subject.observations().len(), 3);
}

#[test]
fn test_read_nonmem_evid_101() {
    let path = write_temp(
        "mapbayes_101.csv",
        "ID,TIME,DV,AMT,EVID\n\
         1,0,.,500,101\n\
         1,2,8.0,.,0\n",
    );

    let subjects = read_nonmem(path.to_str().unwrap()).unwrap();
    let subject = &subjects[0];

    // The combined event yields a dose plus a zero observation at time 0.
    assert_eq!(subject.observations().len(), 2);
    let (_, first) = subject.observations()[0];
    assert_eq!(first.time(), 0.0);
    assert_eq!(first.value(), Some(0.0));
}

#[test]
fn test_read_nonmem_multiple_subjects_keep_order() {
    let path = write_temp(
        "mapbayes_multi.csv",
        "ID,TIME,DV,AMT,EVID\n\
         beta,0,.,100,1\n\
         beta,1,9.0,.,0\n\
         alpha,0,.,200,1\n\
         alpha,1,18.0,.,0\n",
    );

    let subjects = read_nonmem(path.to_str().unwrap()).unwrap();
    assert_eq!(subjects.len(), 2);
    assert_eq!(subjects[0].id(), "beta");
    assert_eq!(subjects[1].id(), "alpha");
}

#[test]
fn test_estimation_from_parsed_dataset() {
    let path = write_temp(
        "mapbayes_estimate.csv",
        "ID,TIME,DV,AMT,EVID\n\
         1,0,.,2000,1\n\
         1,1,25.0,.,0\n\
         1,14,5.5,.,0\n",
    );

    let subjects = read_nonmem(path.to_str().unwrap()).unwrap();
    let prior = PriorModel::new(
        Theta::new(vec![("Cl", 4.0), ("Vc", 70.0)]),
        Omega::diagonal(vec![("Cl", 0.09), ("Vc", 0.04)]),
        Sigma::Single(vec![0.5]),
        None,
        vec![],
        ErrorModel::additive(),
        OneCompartmentIV::new(),
    )
    .unwrap();

    let result = MapEstimator::new(&prior, &subjects[0]).estimate().unwrap();
    assert!(result.ofv().is_finite());
    assert_eq!(result.eta().len(), 2);
}
