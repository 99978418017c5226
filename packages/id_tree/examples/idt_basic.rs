//! A small handle table built on `IdTree`: objects get IDs, are looked up by ID and keep their
//! addresses while the table changes around them.

use id_tree::IdTree;

#[derive(Debug)]
struct Module {
    name: &'static str,
    instances: u32,
}

fn main() {
    let mut modules = IdTree::<Module>::builder()
        .fan_out_bits(4)
        .build()
        .unwrap();

    let (scheduler, _) = modules
        .append(Module {
            name: "scheduler",
            instances: 1,
        })
        .unwrap();

    let (parser, _) = modules
        .append(Module {
            name: "parser",
            instances: 3,
        })
        .unwrap();

    // Callers may also pick their own IDs, far apart from the rest.
    modules
        .set(
            5000,
            Module {
                name: "plugin",
                instances: 0,
            },
        )
        .unwrap();

    let parser_address = modules.get_ptr(parser).unwrap();

    println!(
        "{} modules in a tree of depth {} using {} pages",
        modules.len(),
        modules.depth(),
        modules.page_count()
    );

    modules.get_mut(parser).unwrap().get_mut().instances += 1;
    modules.remove(scheduler);

    for (id, module) in &modules {
        println!("{id}: {} ({} instances)", module.name, module.instances);
    }

    assert_eq!(modules.get_ptr(parser), Some(parser_address));
    println!("parser stayed at {parser_address:?}");
}
