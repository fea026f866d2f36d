use criterion::{criterion_group, criterion_main, Criterion};

use tmplcc::{compile, Options, SourceFile};

fn big_template() -> String {
    let mut body = String::new();
    for i in 0..200 {
        body.push_str(&format!(
            "<p><%= field_{i} | escape %></p>\
             <% if not empty field_{i} %>set<% else %>unset<% end if %>\
             <% foreach x in rows_{i} %><% item %><%= x %><% end item %>\
             <% separator %>, <% end foreach %>\n"
        ));
    }
    format!(
        "<% skin bench %><% view page uses data::page %><% template render() %>\
         {body}<% end template %><% end view %><% end skin %>"
    )
}

fn functions(c: &mut Criterion) {
    let source = big_template();
    c.bench_function("compile", |b| {
        b.iter(|| {
            compile(
                vec![SourceFile::new("bench.tmpl", source.clone())],
                &Options::default(),
            )
            .unwrap()
        })
    });
}

criterion_group!(benches, functions);
criterion_main!(benches);
