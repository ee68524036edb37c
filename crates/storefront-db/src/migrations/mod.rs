mod m2018_12_19_123224_create_products;
